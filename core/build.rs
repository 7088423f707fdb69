fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=MODCSI_PROTO_ROOT");

    // Regeneration is opt-in so builds don't need protoc (uses pre-generated file)
    let Ok(proto_root) = std::env::var("MODCSI_PROTO_ROOT") else {
        return Ok(());
    };
    let csi_proto = format!("{proto_root}/csi/v0/csi.proto");

    println!("cargo:rerun-if-changed={csi_proto}");

    if !std::path::Path::new(&csi_proto).exists() {
        println!("cargo:warning=Proto source not found at {csi_proto}, using pre-generated file");
        return Ok(());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/proto")
        .compile_protos(&[&csi_proto], &[&proto_root])?;

    Ok(())
}
