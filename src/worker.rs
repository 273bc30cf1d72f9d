//! Background spatial query worker.
//!
//! The worker thread holds its own [`SpatialIndex`] built from the same
//! element list as the interactive one, so bulk queries (big viewport scans,
//! depth sorts over many ids) can run off the interactive thread. The bridge
//! speaks a strict request/response protocol: serde-derived enums encoded
//! with bincode into byte frames over `std::sync::mpsc` channels, one
//! response per request, correlated by a `Uuid` envelope id.
//!
//! The worker never panics across the boundary. An undecodable frame is
//! answered with [`WorkerResponse::Error`]; a dead or silent worker surfaces
//! as [`EngineError::WorkerUnavailable`] so the caller can fall back to the
//! synchronous index.

use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use stickerboard_types::{CanvasElement, ViewportBounds};

use crate::error::{EngineError, Result};
use crate::region::{self, RegionKey};
use crate::spatial::SnapResult;
use crate::spatial_index::SpatialIndex;

/// Requests the bridge can send to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Replace the worker's element list wholesale.
    LoadElements { elements: Vec<CanvasElement> },
    QueryViewport { viewport: ViewportBounds, padding: f64 },
    FindCollisions { id: String },
    QueryPoint { x: f64, y: f64 },
    QueryRegion {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },
    GetBounds,
    SortByDepth { ids: Vec<String> },
    CalculateSnap {
        id: String,
        x: f64,
        y: f64,
        threshold: f64,
    },
    GetVisibleRegions {
        viewport: ViewportBounds,
        cell_size: f64,
        depth: u32,
    },
}

/// Responses the worker sends back; each request kind maps to exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResponse {
    Loaded { count: usize },
    Elements { ids: Vec<String> },
    Bounds { bounds: Option<Rect<f64>> },
    Snap { result: SnapResult },
    Regions { keys: Vec<RegionKey> },
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestEnvelope {
    id: Uuid,
    request: WorkerRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseEnvelope {
    id: Uuid,
    response: WorkerResponse,
}

/// Serve requests until the request channel disconnects.
fn worker_loop(requests: Receiver<Vec<u8>>, responses: Sender<Vec<u8>>) {
    let mut index = SpatialIndex::new();

    while let Ok(frame) = requests.recv() {
        let (id, response) = match bincode::deserialize::<RequestEnvelope>(&frame) {
            Ok(envelope) => (envelope.id, dispatch(&mut index, envelope.request)),
            Err(err) => (
                Uuid::nil(),
                WorkerResponse::Error {
                    message: format!("undecodable request frame: {err}"),
                },
            ),
        };

        let frame = match bincode::serialize(&ResponseEnvelope { id, response }) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("Failed to encode worker response: {err}");
                continue;
            }
        };
        if responses.send(frame).is_err() {
            break;
        }
    }
}

fn dispatch(index: &mut SpatialIndex, request: WorkerRequest) -> WorkerResponse {
    match request {
        WorkerRequest::LoadElements { elements } => {
            index.load(elements);
            WorkerResponse::Loaded { count: index.len() }
        }
        WorkerRequest::QueryViewport { viewport, padding } => WorkerResponse::Elements {
            ids: ids_of(index.query_viewport(&viewport, padding)),
        },
        WorkerRequest::FindCollisions { id } => WorkerResponse::Elements {
            ids: ids_of(index.find_collisions(&id)),
        },
        WorkerRequest::QueryPoint { x, y } => WorkerResponse::Elements {
            ids: ids_of(index.query_point(x, y)),
        },
        WorkerRequest::QueryRegion {
            min_x,
            min_y,
            max_x,
            max_y,
        } => {
            let rect = Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y });
            WorkerResponse::Elements {
                ids: ids_of(index.query_rect(&rect)),
            }
        }
        WorkerRequest::GetBounds => WorkerResponse::Bounds {
            bounds: index.bounds(),
        },
        WorkerRequest::SortByDepth { ids } => WorkerResponse::Elements {
            ids: index.sort_by_depth(&ids),
        },
        WorkerRequest::CalculateSnap { id, x, y, threshold } => WorkerResponse::Snap {
            result: index.calculate_snap(&id, x, y, threshold),
        },
        WorkerRequest::GetVisibleRegions {
            viewport,
            cell_size,
            depth,
        } => WorkerResponse::Regions {
            keys: region::visible_regions(&viewport, cell_size, depth),
        },
    }
}

fn ids_of(elements: Vec<&CanvasElement>) -> Vec<String> {
    elements.into_iter().map(|e| e.id.clone()).collect()
}

struct BridgeChannel {
    requests: Sender<Vec<u8>>,
    responses: Receiver<Vec<u8>>,
}

/// Handle to the worker thread.
///
/// One method per request kind; every call sends a frame and blocks for the
/// matching response up to the configured timeout. Calls are serialized, so
/// the channel pair never carries interleaved conversations. Stale frames
/// left over from a timed-out call are discarded by envelope id.
///
/// Dropping the bridge disconnects the request channel and the worker thread
/// exits on its own; [`WorkerBridge::shutdown`] additionally joins it.
pub struct WorkerBridge {
    channel: Mutex<Option<BridgeChannel>>,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl WorkerBridge {
    /// Start the worker thread.
    pub fn spawn(timeout: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::channel();
        let (response_tx, response_rx) = mpsc::channel();
        let handle = thread::spawn(move || worker_loop(request_rx, response_tx));

        Self {
            channel: Mutex::new(Some(BridgeChannel {
                requests: request_tx,
                responses: response_rx,
            })),
            timeout,
            handle: Some(handle),
        }
    }

    /// Replace the worker's element list. Returns the resident count.
    pub fn load_elements(&self, elements: &[CanvasElement]) -> Result<usize> {
        let response = self.round_trip(WorkerRequest::LoadElements {
            elements: elements.to_vec(),
        })?;
        match response {
            WorkerResponse::Loaded { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    pub fn query_viewport(&self, viewport: &ViewportBounds, padding: f64) -> Result<Vec<String>> {
        self.expect_ids(WorkerRequest::QueryViewport {
            viewport: *viewport,
            padding,
        })
    }

    pub fn find_collisions(&self, id: &str) -> Result<Vec<String>> {
        self.expect_ids(WorkerRequest::FindCollisions { id: id.to_string() })
    }

    pub fn query_point(&self, x: f64, y: f64) -> Result<Vec<String>> {
        self.expect_ids(WorkerRequest::QueryPoint { x, y })
    }

    pub fn query_region(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Vec<String>> {
        self.expect_ids(WorkerRequest::QueryRegion {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    pub fn get_bounds(&self) -> Result<Option<Rect<f64>>> {
        match self.round_trip(WorkerRequest::GetBounds)? {
            WorkerResponse::Bounds { bounds } => Ok(bounds),
            other => Err(unexpected(&other)),
        }
    }

    pub fn sort_by_depth(&self, ids: Vec<String>) -> Result<Vec<String>> {
        self.expect_ids(WorkerRequest::SortByDepth { ids })
    }

    pub fn calculate_snap(&self, id: &str, x: f64, y: f64, threshold: f64) -> Result<SnapResult> {
        let response = self.round_trip(WorkerRequest::CalculateSnap {
            id: id.to_string(),
            x,
            y,
            threshold,
        })?;
        match response {
            WorkerResponse::Snap { result } => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub fn get_visible_regions(
        &self,
        viewport: &ViewportBounds,
        cell_size: f64,
        depth: u32,
    ) -> Result<Vec<RegionKey>> {
        let response = self.round_trip(WorkerRequest::GetVisibleRegions {
            viewport: *viewport,
            cell_size,
            depth,
        })?;
        match response {
            WorkerResponse::Regions { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    /// Disconnect the channels and join the worker thread.
    ///
    /// Later calls on the bridge return [`EngineError::WorkerUnavailable`].
    pub fn shutdown(&mut self) -> Result<()> {
        if let Ok(mut channel) = self.channel.lock() {
            channel.take();
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| EngineError::Worker("worker thread panicked".to_string()))?;
        }
        Ok(())
    }

    fn expect_ids(&self, request: WorkerRequest) -> Result<Vec<String>> {
        match self.round_trip(request)? {
            WorkerResponse::Elements { ids } => Ok(ids),
            other => Err(unexpected(&other)),
        }
    }

    fn round_trip(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let guard = self.lock_channel()?;
        let Some(channel) = guard.as_ref() else {
            return Err(EngineError::WorkerUnavailable);
        };

        let id = Uuid::new_v4();
        let frame = bincode::serialize(&RequestEnvelope { id, request })?;
        channel
            .requests
            .send(frame)
            .map_err(|_| EngineError::WorkerUnavailable)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::WorkerUnavailable);
            }

            let frame = match channel.responses.recv_timeout(remaining) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::WorkerUnavailable);
                }
            };

            let envelope: ResponseEnvelope = bincode::deserialize(&frame)?;
            if envelope.id != id {
                // Leftover answer to a call that already timed out.
                log::debug!("Discarding stale worker response {}", envelope.id);
                continue;
            }
            return match envelope.response {
                WorkerResponse::Error { message } => Err(EngineError::Worker(message)),
                response => Ok(response),
            };
        }
    }

    fn lock_channel(&self) -> Result<MutexGuard<'_, Option<BridgeChannel>>> {
        self.channel.lock().map_err(|_| EngineError::Lock)
    }
}

#[inline]
fn unexpected(response: &WorkerResponse) -> EngineError {
    EngineError::Protocol(format!("unexpected worker response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sticker(id: &str, x: f64, y: f64) -> CanvasElement {
        CanvasElement::sticker(id, "https://files.test/img.png", x, y, 100.0, 100.0)
    }

    fn bridge_with_elements(elements: &[CanvasElement]) -> WorkerBridge {
        let bridge = WorkerBridge::spawn(Duration::from_secs(2));
        let count = bridge.load_elements(elements).unwrap();
        assert_eq!(count, elements.len());
        bridge
    }

    #[test]
    fn test_load_and_query_viewport() {
        let bridge = bridge_with_elements(&[
            sticker("a", 0.0, 0.0),
            sticker("b", 300.0, 300.0),
            sticker("far", 10_000.0, 10_000.0),
        ]);

        let viewport = ViewportBounds::new(0.0, 0.0, 500.0, 500.0);
        let mut ids = bridge.query_viewport(&viewport, 0.0).unwrap();
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_query_point_and_region() {
        let bridge = bridge_with_elements(&[sticker("a", 0.0, 0.0), sticker("b", 300.0, 300.0)]);

        assert_eq!(bridge.query_point(50.0, 50.0).unwrap(), ["a"]);
        assert_eq!(bridge.query_point(5000.0, 5000.0).unwrap(), Vec::<String>::new());

        let ids = bridge.query_region(250.0, 250.0, 500.0, 500.0).unwrap();
        assert_eq!(ids, ["b"]);
    }

    #[test]
    fn test_find_collisions() {
        let bridge = bridge_with_elements(&[
            sticker("a", 0.0, 0.0),
            sticker("overlap", 50.0, 50.0),
            sticker("clear", 500.0, 500.0),
        ]);

        assert_eq!(bridge.find_collisions("a").unwrap(), ["overlap"]);
        assert_eq!(bridge.find_collisions("missing").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_get_bounds() {
        let bridge = WorkerBridge::spawn(Duration::from_secs(2));
        assert_eq!(bridge.get_bounds().unwrap(), None);

        bridge
            .load_elements(&[sticker("a", 0.0, 0.0), sticker("b", 900.0, 400.0)])
            .unwrap();
        let bounds = bridge.get_bounds().unwrap().unwrap();
        assert_eq!(bounds.min().x, 0.0);
        assert_eq!(bounds.max().x, 1000.0);
        assert_eq!(bounds.max().y, 500.0);
    }

    #[test]
    fn test_sort_by_depth() {
        let bridge = bridge_with_elements(&[
            sticker("top", 0.0, 0.0).with_z_index(9),
            sticker("bottom", 0.0, 0.0).with_z_index(-3),
            sticker("mid", 0.0, 0.0).with_z_index(2),
        ]);

        let ids = bridge
            .sort_by_depth(vec![
                "top".to_string(),
                "unknown".to_string(),
                "bottom".to_string(),
                "mid".to_string(),
            ])
            .unwrap();
        assert_eq!(ids, ["bottom", "mid", "top"]);
    }

    #[test]
    fn test_calculate_snap_matches_sync_index() {
        let elements = vec![sticker("anchor", 0.0, 0.0), sticker("dragged", 300.0, 0.0)];
        let bridge = bridge_with_elements(&elements);

        let mut index = SpatialIndex::new();
        index.load(elements);
        let sync = index.calculate_snap("dragged", 104.0, 0.0, 6.0);

        let remote = bridge.calculate_snap("dragged", 104.0, 0.0, 6.0).unwrap();
        assert_eq!(remote, sync);
        assert_eq!(remote.snapped_x, Some(100.0));
    }

    #[test]
    fn test_get_visible_regions_matches_pure_function() {
        let bridge = WorkerBridge::spawn(Duration::from_secs(2));
        let viewport = ViewportBounds::new(0.0, 0.0, 100.0, 100.0);

        let keys = bridge.get_visible_regions(&viewport, 512.0, 1).unwrap();
        assert_eq!(keys, region::visible_regions(&viewport, 512.0, 1));
        assert_eq!(keys.len(), 9);
    }

    #[test]
    fn test_reload_replaces_elements() {
        let bridge = bridge_with_elements(&[sticker("a", 0.0, 0.0)]);
        assert_eq!(bridge.load_elements(&[sticker("b", 0.0, 0.0)]).unwrap(), 1);

        let ids = bridge
            .query_viewport(&ViewportBounds::new(0.0, 0.0, 100.0, 100.0), 0.0)
            .unwrap();
        assert_eq!(ids, ["b"]);
    }

    #[test]
    fn test_silent_worker_times_out() {
        // A channel pair with no worker on the other end: the request is sent
        // but nothing ever answers.
        let (request_tx, _request_rx) = mpsc::channel();
        let (_response_tx, response_rx) = mpsc::channel();
        let bridge = WorkerBridge {
            channel: Mutex::new(Some(BridgeChannel {
                requests: request_tx,
                responses: response_rx,
            })),
            timeout: Duration::from_millis(20),
            handle: None,
        };

        let err = bridge.query_point(0.0, 0.0).unwrap_err();
        assert_eq!(err, EngineError::WorkerUnavailable);
    }

    #[test]
    fn test_shutdown_then_call_is_unavailable() {
        let mut bridge = WorkerBridge::spawn(Duration::from_secs(2));
        bridge.shutdown().unwrap();

        let err = bridge.get_bounds().unwrap_err();
        assert_eq!(err, EngineError::WorkerUnavailable);
    }

    #[test]
    fn test_stale_response_is_discarded() {
        let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>();
        let (response_tx, response_rx) = mpsc::channel::<Vec<u8>>();

        // Fake worker: answer with a stale envelope first, the real one second.
        thread::spawn(move || {
            let frame = request_rx.recv().unwrap();
            let envelope: RequestEnvelope = bincode::deserialize(&frame).unwrap();

            let stale = ResponseEnvelope {
                id: Uuid::new_v4(),
                response: WorkerResponse::Loaded { count: 999 },
            };
            response_tx.send(bincode::serialize(&stale).unwrap()).unwrap();

            let real = ResponseEnvelope {
                id: envelope.id,
                response: WorkerResponse::Elements { ids: vec!["a".to_string()] },
            };
            response_tx.send(bincode::serialize(&real).unwrap()).unwrap();
        });

        let bridge = WorkerBridge {
            channel: Mutex::new(Some(BridgeChannel {
                requests: request_tx,
                responses: response_rx,
            })),
            timeout: Duration::from_secs(2),
            handle: None,
        };

        assert_eq!(bridge.query_point(0.0, 0.0).unwrap(), ["a"]);
    }

    #[test]
    fn test_error_response_surfaces_as_worker_error() {
        let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>();
        let (response_tx, response_rx) = mpsc::channel::<Vec<u8>>();

        thread::spawn(move || {
            let frame = request_rx.recv().unwrap();
            let envelope: RequestEnvelope = bincode::deserialize(&frame).unwrap();
            let reply = ResponseEnvelope {
                id: envelope.id,
                response: WorkerResponse::Error {
                    message: "index exploded".to_string(),
                },
            };
            response_tx.send(bincode::serialize(&reply).unwrap()).unwrap();
        });

        let bridge = WorkerBridge {
            channel: Mutex::new(Some(BridgeChannel {
                requests: request_tx,
                responses: response_rx,
            })),
            timeout: Duration::from_secs(2),
            handle: None,
        };

        let err = bridge.get_bounds().unwrap_err();
        assert_eq!(err, EngineError::Worker("index exploded".to_string()));
    }

    #[test]
    fn test_undecodable_frame_yields_error_response() {
        let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>();
        let (response_tx, response_rx) = mpsc::channel::<Vec<u8>>();
        thread::spawn(move || worker_loop(request_rx, response_tx));

        request_tx.send(vec![0xff, 0x00, 0xab]).unwrap();

        let frame = response_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let envelope: ResponseEnvelope = bincode::deserialize(&frame).unwrap();
        assert_eq!(envelope.id, Uuid::nil());
        assert!(matches!(envelope.response, WorkerResponse::Error { .. }));
    }

    #[test]
    fn test_mismatched_kind_is_protocol_error() {
        let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>();
        let (response_tx, response_rx) = mpsc::channel::<Vec<u8>>();

        // Fake worker answers a point query with a Loaded response.
        thread::spawn(move || {
            let frame = request_rx.recv().unwrap();
            let envelope: RequestEnvelope = bincode::deserialize(&frame).unwrap();
            let reply = ResponseEnvelope {
                id: envelope.id,
                response: WorkerResponse::Loaded { count: 1 },
            };
            response_tx.send(bincode::serialize(&reply).unwrap()).unwrap();
        });

        let bridge = WorkerBridge {
            channel: Mutex::new(Some(BridgeChannel {
                requests: request_tx,
                responses: response_rx,
            })),
            timeout: Duration::from_secs(2),
            handle: None,
        };

        let err = bridge.query_point(0.0, 0.0).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }
}
