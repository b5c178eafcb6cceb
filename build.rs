//! Generates the relay's protobuf messages and gRPC services

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/py_lab_hal.proto"], &["proto"])?;

    Ok(())
}
