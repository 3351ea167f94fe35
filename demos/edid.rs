use std::env::args;
use std::io;
use std::path::Path;

use ddcmon::edid::{ParsedEdid, EDID_SIZE};

fn dump<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();
    println!("Opening {}", path.display());

    let mut channel = ddcmon::from_i2c_device(path)?;
    let mut block = [0u8; EDID_SIZE];
    let len = channel
        .read_edid(0, &mut block)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let edid = ParsedEdid::parse(&block[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    println!("EDID synopsis:");
    println!("   Mfg id:        {}", edid.mfg_id());
    println!("   Model:         {}", edid.model_name());
    println!("   Serial number: {}", edid.serial_ascii());
    println!("   Product code:  {:#06x}", edid.product_code());

    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    match args().nth(1) {
        Some(path) => dump(path).expect("failed to get EDID"),
        #[cfg(feature = "udev")]
        None => ddcmon::Enumerator::new()
            .expect("failed to enumerate DDC devices")
            .for_each(|p| match dump(&p) {
                Ok(()) => (),
                Err(e) => println!("Failure on {}: {}", p.display(), e),
            }),
        #[cfg(not(feature = "udev"))]
        None => panic!("argument: i2c device path"),
    }
}
