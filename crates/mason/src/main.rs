// Thin launcher; everything lives in the library so integration tests can
// drive the same code paths.
#![allow(unused_crate_dependencies)]

fn main() -> anyhow::Result<()> {
    mason::main()
}
