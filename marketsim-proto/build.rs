fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Generated code and the descriptor set land in OUT_DIR; the descriptor
    // set backs gRPC reflection in marketsim-api.
    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    println!("cargo:rerun-if-changed=../proto/marketdata.proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("marketdata_descriptor.bin"))
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .message_attribute(".", "#[serde(default)]")
        .compile_protos(&["../proto/marketdata.proto"], &["../proto"])?;

    Ok(())
}
