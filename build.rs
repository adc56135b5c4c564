fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/clustermeta.proto");

    // protox is a pure-Rust protobuf compiler; no system `protoc` needed.
    let fds = protox::compile(["proto/clustermeta.proto"], ["proto/"])?;

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds(fds)?;

    Ok(())
}
