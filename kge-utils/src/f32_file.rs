use anyhow::{anyhow, Result};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

const F32_SIZE: usize = std::mem::size_of::<f32>();

pub fn write_f32_file(path: &Path, values: impl IntoIterator<Item = f32>) -> Result<usize> {
    let file = File::create(path)
        .map_err(|e| anyhow!("Failed to create '{}': {}", path.display(), e))?;
    let mut writer = BufWriter::new(file);
    let mut count = 0;
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

pub fn read_f32_file(path: &Path) -> Result<Vec<f32>> {
    let file =
        File::open(path).map_err(|e| anyhow!("Failed to open '{}': {}", path.display(), e))?;
    let mut bytes = Vec::new();
    BufReader::new(file).read_to_end(&mut bytes)?;
    if bytes.len() % F32_SIZE != 0 {
        return Err(anyhow!(
            "'{}' has {} bytes, which is not a whole number of f32 values",
            path.display(),
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(F32_SIZE)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn read_f32_file_exact(path: &Path, expected_len: usize) -> Result<Vec<f32>> {
    let values = read_f32_file(path)?;
    if values.len() != expected_len {
        return Err(anyhow!(
            "'{}' holds {} values, expected {}",
            path.display(),
            values.len(),
            expected_len
        ));
    }
    Ok(values)
}
