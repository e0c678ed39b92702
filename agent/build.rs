fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use bundled protoc
    // SAFETY: This is safe in a build script context where we control the environment
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    // The tunnel contract is owned by the server crate; compile the same file.
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../server/proto/tunnel.proto"], &["../server/proto/"])?;
    Ok(())
}
