use std::env::args;

use anyhow::{bail, Result};

use tensorcrate::{open_file, read_tensors};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let fname = if let Some(fname) = args().nth(1) {
        println!("* Dumping: {fname}\n");
        fname
    } else {
        bail!("Specify a safetensors, gguf, or pytorch checkpoint filename!");
    };
    let storage = open_file(fname)?;
    let mut reader = read_tensors(storage, false)?;
    while reader.read_next_buffer()? {
        println!("buffer: {} byte(s)", reader.buffer_size());
        for info in reader.tensors_in_buffer() {
            println!(
                "  {:<40} {:?} shape={:?} stride={:?} offset={} size={}",
                info.name, info.value_type, info.shape, info.stride, info.offset_start, info.size_bytes
            );
        }
    }
    Ok(())
}
