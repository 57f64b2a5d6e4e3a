//! Version command.

pub fn run() {
    println!("weft {}", env!("CARGO_PKG_VERSION"));
}
