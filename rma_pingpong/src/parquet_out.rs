use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::report::Measurement;

fn u64_column(rows: &[Measurement], f: impl Fn(&Measurement) -> u64) -> ArrayRef {
    Arc::new(UInt64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn f64_column(rows: &[Measurement], f: impl Fn(&Measurement) -> f64) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

/// Write one row per payload size. Does nothing for an empty sweep.
pub fn write_parquet(path: &str, rows: &[Measurement]) -> Result<(), Box<dyn std::error::Error>> {
    if rows.is_empty() {
        return Ok(());
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("size", DataType::UInt64, false),
        Field::new("iters", DataType::UInt64, false),
        Field::new("warmup", DataType::UInt64, false),
        Field::new("elapsed_ns", DataType::UInt64, false),
        Field::new("latency_us", DataType::Float64, false),
        Field::new("msg_rate", DataType::Float64, false),
        Field::new("bandwidth_mbps", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            u64_column(rows, |m| m.size as u64),
            u64_column(rows, |m| m.iters as u64),
            u64_column(rows, |m| m.warmup as u64),
            u64_column(rows, |m| m.elapsed.as_nanos() as u64),
            f64_column(rows, Measurement::latency_us),
            f64_column(rows, Measurement::msg_rate),
            f64_column(rows, Measurement::bandwidth_mbps),
        ],
    )?;

    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parquet::file::reader::{FileReader, SerializedFileReader};

    use super::*;

    #[test]
    fn writes_one_row_per_size() {
        let rows: Vec<Measurement> = [8usize, 16, 32]
            .into_iter()
            .map(|size| Measurement {
                size,
                iters: 100,
                warmup: 10,
                elapsed: Duration::from_micros(250),
            })
            .collect();

        let path =
            std::env::temp_dir().join(format!("rma_pingpong_{}.parquet", std::process::id()));
        let path_str = path.to_str().unwrap();
        write_parquet(path_str, &rows).unwrap();

        let reader = SerializedFileReader::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 3);
        assert_eq!(reader.metadata().file_metadata().schema_descr().num_columns(), 7);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_sweep_writes_nothing() {
        let path = std::env::temp_dir().join("rma_pingpong_empty.parquet");
        write_parquet(path.to_str().unwrap(), &[]).unwrap();
        assert!(!path.exists());
    }
}
