use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    match input_file.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer; `stdout`
/// writes to the standard output
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }
    let file = File::create(output_file)?;
    match Path::new(output_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufWriter::new(flate2::write::GzEncoder::new(
            file,
            flate2::Compression::default(),
        )))),
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Read a whitespace-separated numeric matrix, one row per line; blank
/// lines and lines starting with `#` are skipped
///
pub fn read_matrix(input_file: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let buf = open_buf_reader(input_file)?;
    let mut values = vec![];
    let mut ncol = None;
    let mut nrow = 0;

    for (i, line) in buf.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|w| w.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("line {}: {}", i + 1, e))?;

        match ncol {
            None => ncol = Some(row.len()),
            Some(d) if d != row.len() => {
                anyhow::bail!("line {}: expected {} columns, found {}", i + 1, d, row.len())
            }
            _ => {}
        }
        values.extend(row);
        nrow += 1;
    }

    let ncol = ncol.ok_or(anyhow::anyhow!("no data rows in {:?}", input_file))?;
    Ok(Tensor::from_vec(values, (nrow, ncol), device)?)
}

///
/// Write the rows of a 2d tensor, tab-separated
///
pub fn write_matrix(x_nd: &Tensor, output: &mut dyn Write) -> anyhow::Result<()> {
    let rows = x_nd.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
    for row in rows {
        let line = row
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        if let Err(e) = writeln!(output, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            }
            return Err(e.into());
        }
    }
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_skips_comments_and_checks_width() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.tsv");
        let mut f = File::create(&path)?;
        writeln!(f, "# header")?;
        writeln!(f, "0\t1\t0")?;
        writeln!(f)?;
        writeln!(f, "1 1 0.5")?;
        drop(f);

        let x = read_matrix(&path, &Device::Cpu)?;
        assert_eq!(x.dims(), &[2, 3]);
        assert_eq!(x.sum_all()?.to_scalar::<f32>()?, 3.5);

        let bad = dir.path().join("bad.tsv");
        std::fs::write(&bad, "1 2\n3\n")?;
        assert!(read_matrix(&bad, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn gzip_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.tsv.gz");
        let path_str = path.to_str().ok_or(anyhow::anyhow!("path"))?;
        let x = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?;
        {
            let mut out = open_buf_writer(path_str)?;
            write_matrix(&x, out.as_mut())?;
        }
        let y = read_matrix(&path, &Device::Cpu)?;
        assert_eq!(y.to_vec2::<f32>()?, x.to_vec2::<f32>()?);
        Ok(())
    }
}
