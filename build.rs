fn main() {
    // Tell cargo to rerun the build script if the token grammar changes
    println!("cargo:rerun-if-changed=src/lexer.pest");
}
