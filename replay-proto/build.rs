use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Get the path to the proto files
    let proto_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?)
        .parent()
        .unwrap()
        .join("proto");

    // Chunk payloads are shared by reference all the way to the wire
    let mut config = prost_build::Config::new();
    config.bytes([".replay.v1.ChunkData.data"]);

    // Configure the protobuf compiler
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Compile the proto files
        .compile_protos_with_config(
            config,
            &[
                proto_root.join("replay/v1/replay.proto"),
                proto_root.join("replay/v1/service.proto"),
            ],
            &[proto_root],
        )?;

    Ok(())
}
