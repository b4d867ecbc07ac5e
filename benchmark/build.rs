//! Build script to compile the shared protobuf definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile(&["../raftex/proto/executor.proto"], &["../raftex/proto"])?;

    println!("cargo:rerun-if-changed=../raftex/proto/executor.proto");

    Ok(())
}
