use std::env::args;
use std::str;

fn main() {
    tracing_subscriber::fmt::init();

    let path = args().nth(1).expect("argument: i2c device path");
    let mut channel = ddcmon::from_i2c_device(path).expect("failed to open i2c device");

    let caps = channel
        .capabilities_string()
        .expect("failed to read ddc capabilities");
    let caps = str::from_utf8(&caps).expect("caps was not a valid string");
    println!("got CAPS: {}", caps);
}
