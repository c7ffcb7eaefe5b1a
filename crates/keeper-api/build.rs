fn main() {
    // Compile the keeper gRPC service proto
    tonic_prost_build::configure()
        .compile_protos(&["proto/keeper.proto"], &["proto"])
        .unwrap();
}
