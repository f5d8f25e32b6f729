fn main() {
    println!("cargo::rerun-if-changed=../../mirrorfs.capnp");
    capnpc::CompilerCommand::new()
        .src_prefix("../../")
        .file("../../mirrorfs.capnp")
        .run()
        .expect("Failed to compile Cap'n Proto schema");
}
