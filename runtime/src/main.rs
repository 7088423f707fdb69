//! `modcsi` - serve one CSI plugin on `CSI_ENDPOINT`

#[tokio::main]
async fn main() {
    if let Err(e) = modcsi_runtime::run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
