use std::env::args;

use ddcmon::commands;

fn main() {
    tracing_subscriber::fmt::init();

    let path = args().nth(1).expect("argument: i2c device path");
    let mut channel = ddcmon::from_i2c_device(path).expect("failed to open i2c device");

    let mccs_ver = channel
        .execute(commands::GetVcpFeature::new(0xdf))
        .expect("failed to read VCP value");
    println!("MCCS version is {:04x}", mccs_ver.value());

    let brightness = channel
        .execute(commands::GetVcpFeature::new(0x10))
        .expect("failed to read VCP value");
    println!("brightness is {}/{}", brightness.value(), brightness.maximum());

    if let Some(value) = args().nth(2).and_then(|v| v.parse().ok()) {
        channel
            .execute(commands::SetVcpFeature::new(0x10, value))
            .expect("failed to set brightness");
        println!("brightness set to {}", value);
    }
}
