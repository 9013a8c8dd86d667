//! End-to-end tests: requests go through the dispatcher, the executor and
//! the publisher, with fake rasterizer, office suite and destination.
//!
//! Nothing here needs pdfium, LibreOffice or network access. Tests that
//! watermark pages need a TrueType font and print a SKIP line without one.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use render_relay::convert::{encode_png, ExportTarget};
use render_relay::dispatch::{
    DiscardRequest, Payload, PreviewRequest, PublishRequest, RenderRequest,
};
use render_relay::publish::{
    DeliveredMessage, DeliveryError, Destination, MemoryPublicationSink, PublishStats,
};
use render_relay::watermark::{Compositor, FontLibrary, TileCache, WatermarkOverrides};
use render_relay::{
    BlobStore, Converters, DispatchSettings, Dispatcher, FailureKind, MemoryBlobStore,
    OfficeConverter, PageSelection, PipelineConfig, Publisher, Rasterizer, RelayError,
    TaskExecutor, TaskOutput, TaskRequest, WatermarkSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Renders `pages` white 400×300 pages for any input.
struct WhitePages {
    pages: usize,
    calls: AtomicUsize,
}

impl Rasterizer for WhitePages {
    fn rasterize(
        &self,
        _pdf: &[u8],
        _dpi: u32,
        _max_pixels: u32,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let page = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, Rgb([255, 255, 255])));
        let n = limit.map_or(self.pages, |l| l.min(self.pages));
        (0..n).map(|_| encode_png(&page)).collect()
    }
}

/// An office suite that "exports" every document as a PDF.
struct FakeOffice;

#[async_trait]
impl OfficeConverter for FakeOffice {
    async fn convert(
        &self,
        _bytes: &[u8],
        _suffix: &str,
        target: ExportTarget,
    ) -> Result<Vec<u8>, RelayError> {
        match target {
            ExportTarget::Pdf(_) => Ok(b"%PDF-1.7 fake".to_vec()),
            ExportTarget::Xlsx => Err(RelayError::ConversionRejected {
                tool: "fake office".into(),
                detail: "no spreadsheets here".into(),
            }),
        }
    }
}

/// Fails the first `failures` sends, then records every document.
#[derive(Default)]
struct Channel {
    failures: usize,
    calls: AtomicUsize,
    received: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl Destination for Channel {
    async fn send_document(
        &self,
        _destination_id: i64,
        bytes: &[u8],
        filename: &str,
    ) -> Result<DeliveredMessage, DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(DeliveryError::Status {
                status: 502,
                body: "Bad Gateway".into(),
            });
        }
        let mut received = self.received.lock().unwrap();
        received.push((filename.to_string(), bytes.to_vec()));
        Ok(DeliveredMessage {
            message_id: 500 + received.len() as i64,
            file_kind: Some("image/png".into()),
            views: Some(0),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Relay {
    dispatcher: Dispatcher,
    store: Arc<MemoryBlobStore>,
    channel: Arc<Channel>,
    sink: Arc<MemoryPublicationSink>,
    tiles: Arc<TileCache>,
    rasterizer: Arc<WhitePages>,
}

fn relay(pages: usize, channel: Channel) -> Relay {
    let config = Arc::new(
        PipelineConfig::builder()
            .publish_backoff(vec![Duration::ZERO, Duration::ZERO, Duration::ZERO])
            .build()
            .unwrap(),
    );
    let store = Arc::new(MemoryBlobStore::default());
    let channel = Arc::new(channel);
    let sink = Arc::new(MemoryPublicationSink::new());
    let tiles = Arc::new(TileCache::new(config.tile_cache_capacity));
    let rasterizer = Arc::new(WhitePages {
        pages,
        calls: AtomicUsize::new(0),
    });

    let publisher = Publisher::new(
        channel.clone(),
        config.publish_backoff.clone(),
        sink.clone(),
        Arc::new(PublishStats::default()),
    );
    let executor = TaskExecutor::new(
        config.clone(),
        store.clone(),
        Converters::new(Some(rasterizer.clone()), Some(Arc::new(FakeOffice))),
        Arc::new(Compositor::new(tiles.clone())),
        Arc::new(publisher),
    );
    let dispatcher = Dispatcher::start(DispatchSettings::default(), Arc::new(executor));

    Relay {
        dispatcher,
        store,
        channel,
        sink,
        tiles,
        rasterizer,
    }
}

fn font_available() -> bool {
    let d = WatermarkSettings::default();
    if FontLibrary::default()
        .resolve(&d.font_preferred, &d.font_fallback)
        .is_err()
    {
        println!("SKIP: no TrueType font installed");
        return false;
    }
    true
}

fn render(payload: Payload, filename: &str, watermark: Option<&str>) -> TaskRequest {
    TaskRequest::Render(RenderRequest {
        destination_id: -1001234567890,
        payload,
        filename: filename.into(),
        format: None,
        mime: None,
        watermark: watermark.map(str::to_string),
        overrides: WatermarkOverrides::default(),
        pages: PageSelection::All,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn preview_then_publish_every_page_with_a_watermark() {
    if !font_available() {
        return;
    }
    let relay = relay(3, Channel::default());
    let source = relay
        .store
        .store("source", b"%PDF-1.7".to_vec(), None)
        .await
        .unwrap();

    let preview = relay
        .dispatcher
        .submit(TaskRequest::Preview(PreviewRequest {
            payload: Payload::BlobKey(source.clone()),
            filename: "Board Minutes.pdf".into(),
            format: None,
            release_source: false,
        }))
        .unwrap();
    assert_eq!(preview.queue, "preview");
    let TaskOutput::Preview(result) = preview.wait().await.unwrap() else {
        panic!("expected a preview result");
    };
    assert_eq!(result.pages.len(), 3);
    // source + a PNG and a JPEG per page
    assert_eq!(relay.store.len(), 7);

    let ticket = relay
        .dispatcher
        .submit(render(Payload::BlobKey(source), "Board Minutes.pdf", Some("CONFIDENTIAL")))
        .unwrap();
    assert_eq!(ticket.queue, "pdf");
    let TaskOutput::Batch(batch) = ticket.wait().await.unwrap() else {
        panic!("expected a batch outcome");
    };

    assert!(batch.ok, "{:?}", batch.failures);
    let names: Vec<_> = relay
        .sink
        .records()
        .iter()
        .map(|r| r.filename.clone())
        .collect();
    assert_eq!(
        names,
        ["Board_Minutes-001.png", "Board_Minutes-002.png", "Board_Minutes-003.png"]
    );
    // Three identical pages share one rendered tile.
    let stats = relay.tiles.stats();
    assert_eq!(stats.renders, 1);
    assert_eq!(stats.hits, 2);

    // The render claimed the source.
    assert_eq!(relay.store.len(), 6);

    let received = relay.channel.received.lock().unwrap();
    let page = image::load_from_memory(&received[0].1).unwrap().to_rgb8();
    assert!(
        page.pixels().any(|p| p.0 != [255, 255, 255]),
        "watermark left no mark on a white page"
    );
    drop(received);
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn word_documents_go_through_the_office_queue() {
    let relay = relay(2, Channel::default());
    let ticket = relay
        .dispatcher
        .submit(render(Payload::inline(b"PK\x03\x04"), "memo.docx", None))
        .unwrap();
    assert_eq!(ticket.queue, "office");

    let TaskOutput::Batch(batch) = ticket.wait().await.unwrap() else {
        panic!("expected a batch outcome");
    };
    assert_eq!(batch.published.len(), 2);
    assert_eq!(batch.published[0].filename, "memo-001.png");
    assert_eq!(relay.rasterizer.calls.load(Ordering::SeqCst), 1);
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn png_uploads_publish_from_the_publish_queue() {
    let relay = relay(0, Channel::default());
    let png = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(64, 48))).unwrap();
    let ticket = relay
        .dispatcher
        .submit(render(Payload::inline(&png), "scan.png", None))
        .unwrap();
    assert_eq!(ticket.queue, "publish");

    let TaskOutput::Batch(batch) = ticket.wait().await.unwrap() else {
        panic!("expected a batch outcome");
    };
    assert_eq!(batch.published.len(), 1);
    assert_eq!(batch.published[0].filename, "scan-001.png");
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn flaky_destination_is_retried_within_the_schedule() {
    let relay = relay(
        0,
        Channel {
            failures: 2,
            ..Default::default()
        },
    );
    let png = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(8, 8))).unwrap();
    let key = relay.store.store("renderpng", png, None).await.unwrap();

    let ticket = relay
        .dispatcher
        .submit(TaskRequest::Publish(PublishRequest {
            destination_id: 42,
            payload: Payload::BlobKey(key),
            filename: "page-01.png".into(),
            watermark: None,
            apply_watermark: true,
            overrides: WatermarkOverrides::default(),
        }))
        .unwrap();
    let TaskOutput::Published(record) = ticket.wait().await.unwrap() else {
        panic!("expected a publication record");
    };
    assert_eq!(record.message_id, 501);
    assert_eq!(relay.channel.calls.load(Ordering::SeqCst), 3);
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn exhausted_delivery_is_reported_per_page() {
    let relay = relay(
        2,
        Channel {
            failures: usize::MAX,
            ..Default::default()
        },
    );
    let ticket = relay
        .dispatcher
        .submit(render(Payload::inline(b"%PDF"), "a.pdf", None))
        .unwrap();
    let TaskOutput::Batch(batch) = ticket.wait().await.unwrap() else {
        panic!("expected a batch outcome");
    };
    assert!(!batch.ok);
    assert_eq!(batch.failures.len(), 2);
    assert!(batch
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::Delivery && f.reason.contains("502")));
    // four attempts per page, no task-level retry on top
    assert_eq!(relay.channel.calls.load(Ordering::SeqCst), 8);
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn claimed_and_expired_sources_fail_without_retry() {
    let relay = relay(1, Channel::default());
    let key = render_relay::BlobKey::generate("source");
    let err = relay
        .dispatcher
        .submit(render(Payload::BlobKey(key), "gone.pdf", None))
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Storage);
    assert_eq!(relay.rasterizer.calls.load(Ordering::SeqCst), 0);
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn spreadsheet_without_normalisation_fails_as_input() {
    let relay = relay(1, Channel::default());
    let err = relay
        .dispatcher
        .submit(render(Payload::inline(b"ods"), "budget.ods", None))
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Input);
    assert!(relay.sink.records().is_empty());
    relay.dispatcher.shutdown().await;
}

#[tokio::test]
async fn discard_removes_unused_previews() {
    let relay = relay(2, Channel::default());
    let TaskOutput::Preview(result) = relay
        .dispatcher
        .submit(TaskRequest::Preview(PreviewRequest {
            payload: Payload::inline(b"%PDF"),
            filename: "draft.pdf".into(),
            format: None,
            release_source: false,
        }))
        .unwrap()
        .wait()
        .await
        .unwrap()
    else {
        panic!("expected a preview result");
    };
    assert_eq!(relay.store.len(), 4);

    let ticket = relay
        .dispatcher
        .submit(TaskRequest::Discard(DiscardRequest { keys: result.keys() }))
        .unwrap();
    assert_eq!(ticket.queue, "default");
    assert_eq!(
        ticket.wait().await.unwrap(),
        TaskOutput::Discarded { count: 4 }
    );
    assert!(relay.store.is_empty());
    relay.dispatcher.shutdown().await;
}
