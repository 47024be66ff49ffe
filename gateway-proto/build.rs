fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().build_server(true).build_client(true).compile(
        &[
            "proto/gateway.proto",
            "proto/bind.proto",
            "proto/conn.proto",
            "proto/group.proto",
            "proto/message.proto",
            "proto/slb.proto",
            "proto/handler.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
