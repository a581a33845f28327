mod common;

use std::fs::File;
use std::sync::{Arc, OnceLock};

use common::{tlv_i64, tlv_str, BlockData, SegmentBuilder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use segread::telemetry::reader_metrics;
use segread::{BufferPools, ColumnReader};
use tempfile::tempdir;

fn install_prometheus_once() -> &'static PrometheusHandle {
    static PROM: OnceLock<PrometheusHandle> = OnceLock::new();
    PROM.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install prometheus recorder");
        reader_metrics::describe_all();
        handle
    })
}

fn parse_sample(rendered: &str, metric: &str) -> Option<f64> {
    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parts.next()?;
        if key == metric || key.starts_with(metric) && key.as_bytes().get(metric.len()) == Some(&b'{') {
            if let Ok(v) = val.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

fn parse_counter(rendered: &str, base_name: &str) -> f64 {
    parse_sample(rendered, &format!("{}_total", base_name))
        .or_else(|| parse_sample(rendered, base_name))
        .unwrap_or(0.0)
}

#[test]
fn block_decodes_and_pool_use_are_counted() {
    let prom = install_prometheus_once();
    let before = prom.render();
    let raw_before = parse_counter(&before, reader_metrics::BLOCKS_DECODED_RAW);
    let dict_before = parse_counter(&before, reader_metrics::BLOCKS_DECODED_DICT);
    let misses_before = parse_counter(&before, reader_metrics::POOL_MISSES);

    let dir = tempdir().unwrap();
    let mut b = SegmentBuilder::new(&dir, "seg");
    b.add_block(&[1, 2], vec![("c", BlockData::Raw(vec![tlv_i64(1), tlv_i64(2)]))]);
    b.add_block(&[3, 4], vec![("c", BlockData::Dict(vec![(tlv_str("x"), vec![0, 1])]))]);
    let meta = b.finish();

    let pools = Arc::new(BufferPools::default());
    let file = Arc::new(File::open(meta.column_file_path("c")).unwrap());
    let mut r = ColumnReader::new("c", file, Arc::clone(&meta), pools);
    assert!(r.read_record_from_block(0, 1).unwrap().is_some());
    assert!(r.read_record_from_block(1, 0).unwrap().is_some());

    let after = prom.render();
    assert!(parse_counter(&after, reader_metrics::BLOCKS_DECODED_RAW) >= raw_before + 1.0);
    assert!(parse_counter(&after, reader_metrics::BLOCKS_DECODED_DICT) >= dict_before + 1.0);
    assert!(parse_counter(&after, reader_metrics::POOL_MISSES) >= misses_before + 2.0);
    // Descriptions only reach the exporter when registered after the recorder is installed.
    assert!(after.contains(&format!("# HELP {}", reader_metrics::BLOCKS_DECODED_RAW)));
    assert!(after.contains(&format!("# HELP {}", reader_metrics::POOL_MISSES)));
}
