fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .field_attribute(".swarmcast.Subscriber.latency", "#[serde(skip)]")
        .compile_protos(&["../proto/swarmcast.proto"], &["../proto"])?;

    Ok(())
}
