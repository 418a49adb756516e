use std::env::args;

use anyhow::{bail, Result};

use tensorcrate::{decode_pickle, open_file, StringEncoding};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let fname = if let Some(fname) = args().nth(1) {
        println!("* Dumping: {fname}\n");
        fname
    } else {
        bail!("Specify pickle filename!");
    };
    let storage = open_file(fname)?;
    let root = decode_pickle(storage.as_ref(), StringEncoding::Utf8)?;
    println!("{root:#?}");
    Ok(())
}
