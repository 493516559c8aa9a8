use std::io::Result;

fn main() -> Result<()> {
    let proto_files = &["../shared/proto/agora.proto"];
    let includes = &["../shared/proto"];

    prost_build::compile_protos(proto_files, includes)?;

    for proto in proto_files {
        println!("cargo:rerun-if-changed={}", proto);
    }

    Ok(())
}
