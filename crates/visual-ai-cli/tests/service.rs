//! Integration tests for the worker pool, image source loading, and the
//! request loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use visual_ai::{
    Embedding, EmbeddingProvider, Frame, FramePair, ProviderId, ProviderSet, RequestSettings,
    VisionError, VisionOrchestrator, VisionResult,
};
use visual_ai_cli::config::ServiceConfig;
use visual_ai_cli::{load_frame, load_frames, load_providers, serve, CliError, ValidationService};

// ─────────────────────── helpers ───────────────────────

/// Mean-colour encoder that also tracks how many calls overlap.
#[derive(Default)]
struct SlowColor {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl EmbeddingProvider for SlowColor {
    fn id(&self) -> ProviderId {
        ProviderId::Dinov2
    }

    fn encode_image(&self, frame: &Frame) -> VisionResult<Embedding> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let p = frame.pixels().get_pixel(0, 0).0;
        Embedding::new(
            ProviderId::Dinov2,
            p.iter().map(|c| *c as f32 / 255.0 + 0.01).collect(),
        )
    }
}

fn service(provider: Arc<SlowColor>, workers: usize) -> ValidationService {
    let orch = VisionOrchestrator::new(ProviderSet::new().with(provider));
    ValidationService::new(orch, workers).unwrap()
}

fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb(rgb),
    ));
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    img.write_with_encoder(encoder).unwrap();
    buf
}

fn write_png(dir: &tempfile::TempDir, name: &str, rgb: [u8; 3]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, png_bytes(12, 8, rgb)).unwrap();
    path.to_str().unwrap().to_string()
}

// ─────────────────────── image sources ───────────────────────

#[test]
fn test_load_frame_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_png(&dir, "shot.png", [10, 20, 30]);
    let frame = load_frame(&path).unwrap();
    assert_eq!(frame.dimensions(), (12, 8));
    assert_eq!(frame.pixels().get_pixel(3, 3).0, [10, 20, 30]);
}

#[test]
fn test_load_frame_from_data_uri() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(4, 4, [200, 0, 0]));
    let frame = load_frame(&format!("data:image/png;base64,{encoded}")).unwrap();
    assert_eq!(frame.dimensions(), (4, 4));

    // Unknown mime falls back to sniffing the bytes.
    let frame = load_frame(&format!("data:application/octet-stream;base64,{encoded}")).unwrap();
    assert_eq!(frame.pixels().get_pixel(0, 0).0, [200, 0, 0]);
}

#[test]
fn test_load_frames_keeps_order_and_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let sources = vec![
        write_png(&dir, "a.png", [1, 1, 1]),
        write_png(&dir, "b.png", [2, 2, 2]),
    ];
    let frames = load_frames(&sources).unwrap();
    assert_eq!(frames[1].pixels().get_pixel(0, 0).0, [2, 2, 2]);

    let mut broken = sources.clone();
    broken.push(dir.path().join("missing.png").to_str().unwrap().to_string());
    assert!(matches!(
        load_frames(&broken),
        Err(CliError::ImageSource { .. })
    ));
}

#[test]
fn test_corrupt_file_is_an_image_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.png");
    std::fs::write(&path, b"not a png").unwrap();
    let err = load_frame(path.to_str().unwrap()).unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
}

// ─────────────────────── provider loading ───────────────────────

#[test]
fn test_missing_models_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::resolve(
        Some("dinov2,vjepa2,siglip"),
        Some(dir.path().to_str().unwrap()),
        Some(2),
    )
    .unwrap();
    assert!(config.installed_models().is_empty());
    assert!(load_providers(&config).is_empty());

    let svc = ValidationService::from_config(&config).unwrap();
    assert!(!svc.orchestrator().health().healthy);
}

// ─────────────────────── worker pool ───────────────────────

#[test]
fn test_zero_workers_rejected() {
    let orch = VisionOrchestrator::new(ProviderSet::new());
    assert!(matches!(
        ValidationService::new(orch, 0),
        Err(CliError::Config(_))
    ));
}

#[tokio::test]
async fn test_run_returns_verdict() {
    let svc = service(Arc::new(SlowColor::default()), 2);
    let a = Frame::solid(8, 8, [50, 100, 150]);
    let b = a.clone();
    let verdict = svc
        .run(move |o| o.compare(&a, &b, None, &RequestSettings::default()))
        .await
        .unwrap();
    assert!(verdict.is_match);
    assert_eq!(svc.available_permits(), 2);
}

#[tokio::test]
async fn test_run_surfaces_typed_errors() {
    let svc = service(Arc::new(SlowColor::default()), 1);
    let frame = Frame::solid(8, 8, [1, 2, 3]);
    let err = svc
        .run(move |o| o.find_by_description(&frame, "login", None, &RequestSettings::default()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CliError::Vision(VisionError::UnsupportedCapability { .. })
    ));
    assert_eq!(err.kind(), "unsupported_capability");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_keeps_order_and_respects_worker_cap() {
    let provider = Arc::new(SlowColor::default());
    let svc = service(provider.clone(), 2);

    let pairs: Vec<FramePair> = (0..12u8)
        .map(|i| {
            let base = Frame::solid(4, 4, [i * 20, 0, 0]);
            let actual = if i % 3 == 0 {
                Frame::solid(4, 4, [0, 0, 255])
            } else {
                base.clone()
            };
            FramePair::new(base, actual)
        })
        .collect();

    let verdict = svc
        .batch_compare(pairs, None, RequestSettings::default())
        .await
        .unwrap();

    let ids: Vec<String> = verdict.results.iter().map(|r| r.pair_id.clone()).collect();
    let expected: Vec<String> = (0..12).map(|i| format!("pair_{i}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(verdict.mismatches, 4);
    assert_eq!(verdict.matches, 8);
    assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(
        svc.orchestrator().latency().samples(ProviderId::Dinov2).len(),
        12
    );
}

#[tokio::test]
async fn test_batch_with_invalid_settings_fails_fast() {
    let provider = Arc::new(SlowColor::default());
    let svc = service(provider.clone(), 2);
    let mut settings = RequestSettings::default();
    settings.max_results = 0;

    let pairs = vec![FramePair::new(Frame::solid(2, 2, [0, 0, 0]), Frame::solid(2, 2, [0, 0, 0]))];
    let err = svc.batch_compare(pairs, None, settings).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    assert_eq!(provider.peak.load(Ordering::SeqCst), 0);
}

// ─────────────────────── request loop ───────────────────────

#[tokio::test]
async fn test_serve_answers_each_line_on_one_service() {
    let svc = service(Arc::new(SlowColor::default()), 2);
    let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(4, 4, [40, 80, 120]));
    let uri = format!("data:image/png;base64,{encoded}");

    let input = format!(
        "{}\n\n{}\n{}\n{}\n",
        serde_json::json!({"id": 1, "op": "compare", "baseline": uri, "actual": uri}),
        r#"{"id": "h", "op": "health"}"#,
        "{not json",
        r#"{"id": 7, "op": "teleport"}"#,
    );

    let mut out = Vec::new();
    let handled = serve(&svc, input.as_bytes(), &mut out).await.unwrap();
    assert_eq!(handled, 4);

    let lines: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);

    assert_eq!(lines[0]["id"], 1);
    assert_eq!(lines[0]["ok"], true);
    assert_eq!(lines[0]["result"]["is_match"], true);

    // The latency window outlives the compare request.
    assert_eq!(lines[1]["id"], "h");
    assert_eq!(lines[1]["result"]["providers"][0]["observations"], 1);

    assert!(lines[2]["id"].is_null());
    assert_eq!(lines[2]["ok"], false);
    assert_eq!(lines[2]["error"], "invalid_input");

    assert_eq!(lines[3]["id"], 7);
    assert_eq!(lines[3]["ok"], false);
    assert_eq!(lines[3]["error"], "invalid_input");
}

#[tokio::test]
async fn test_serve_reports_request_errors_and_keeps_going() {
    let svc = service(Arc::new(SlowColor::default()), 1);
    let input = concat!(
        r#"{"id": 1, "op": "find", "image": "missing.png", "description": "login"}"#,
        "\n",
        r#"{"id": 2, "op": "route", "task": "compare_simple"}"#,
        "\n",
    );

    let mut out = Vec::new();
    serve(&svc, input.as_bytes(), &mut out).await.unwrap();
    let lines: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines[0]["ok"], false);
    assert_eq!(lines[0]["error"], "invalid_input");
    assert_eq!(lines[1]["ok"], true);
    assert_eq!(lines[1]["result"]["decision"]["provider"], "dinov2");
}
