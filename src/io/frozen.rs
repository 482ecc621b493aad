//! JSON persistence of frozen rlog parameters

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::Result;
use crate::transform::FrozenRlogParams;

pub fn save_frozen_params<P: AsRef<Path>>(path: P, params: &FrozenRlogParams) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, params)?;
    Ok(())
}

pub fn load_frozen_params<P: AsRef<Path>>(path: P) -> Result<FrozenRlogParams> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
