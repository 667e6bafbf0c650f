fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protos = [
        "proto/daemon.proto",
        "proto/network.proto",
        "proto/peer.proto",
        "proto/chat.proto",
        "proto/transfer.proto",
        "proto/settings.proto",
        "proto/voice.proto",
    ];

    for proto in protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    tonic_build::configure().compile(&protos, &["proto"])?;

    Ok(())
}
