//! Integration tests: config file → service → in-process backend.

use std::io::Write;

use framemux_cli::config::{AppConfig, SourceKind};
use framemux_cli::service::StreamService;
use framemux_core::{MemoryBackend, OutputMode, PacingMode};

fn write_frames(width: usize, height: usize, count: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..count {
        let frame = vec![(i * 40) as u8; width * height * 3];
        file.write_all(&frame).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_raw_file_to_stream() {
    let frames = write_frames(8, 8, 4);
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        config_file,
        r#"
[encoder]
src_width = 8
src_height = 8
dst_width = 4
dst_height = 4
output = "rtmp://localhost/live/test"
mode = "stream"

[source]
kind = "raw"
path = "{}"
frames = 0

[pacing]
mode = "off"
"#,
        frames.path().display()
    )
    .unwrap();

    let config = AppConfig::try_load(config_file.path()).unwrap();
    assert_eq!(config.source.kind, SourceKind::Raw);
    assert_eq!(config.encoder.mode, OutputMode::Stream);

    let backend = MemoryBackend::new();
    let sink = backend.sink();
    let summary = StreamService::new(config).run(backend).unwrap();

    assert_eq!(summary.frames_read, 4);
    assert_eq!(summary.session.format, "flv");
    let record = sink.last().unwrap();
    assert_eq!(record.pts(), vec![0, 33, 67, 100]);
    assert!(record.trailer_written);
}

#[test]
fn test_live_pacing_stamps_increasing_pts() {
    let mut config = AppConfig::default();
    config.encoder.src_width = 16;
    config.encoder.src_height = 16;
    config.encoder.dst_width = 16;
    config.encoder.dst_height = 16;
    config.encoder.output = "live.flv".into();
    config.source.frames = 5;
    config.pacing.mode = PacingMode::Live;

    let backend = MemoryBackend::new();
    let sink = backend.sink();
    StreamService::new(config).run(backend).unwrap();

    let pts = sink.last().unwrap().pts();
    assert_eq!(pts.len(), 5);
    assert_eq!(pts[0], 0);
    assert!(pts.windows(2).all(|w| w[1] > w[0]), "{pts:?}");
}
