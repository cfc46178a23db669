//! Build script for the PromptCache protocol definitions.
//!
//! Compiles `proto/kvstore.proto` into Rust message and service types and
//! emits a file descriptor set so the server can offer gRPC reflection
//! (lets `grpcurl` discover and call the service without proto files).

use std::env;
use std::path::PathBuf;

use prost::Message;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let descriptor_path =
        PathBuf::from(env::var("OUT_DIR")?).join("kvstore_descriptor.bin");

    let file_descriptor_set = protox::compile(["proto/kvstore.proto"], ["proto"])?;
    std::fs::write(&descriptor_path, file_descriptor_set.encode_to_vec())?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(descriptor_path)
        .compile_fds(file_descriptor_set)?;

    println!("cargo:rerun-if-changed=proto/kvstore.proto");
    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
