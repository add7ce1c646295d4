fn main() {
    // Bundled resources are embedded at compile time; rebuild when they change
    println!("cargo:rerun-if-changed=drivers");
    println!("cargo:rerun-if-changed=hooks");

    // Enables static linking of the vcruntime library on Windows builds
    static_vcruntime::metabuild();
}
