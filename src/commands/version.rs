pub fn run() {
    println!("vpsie-autoscaler {}", env!("CARGO_PKG_VERSION"));
}
