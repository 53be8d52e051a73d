//! Concurrent tile loader
//!
//! Coordinates disk-cache reads, HTTP downloads, tile decoding and staged
//! GPU upload behind a per-tile state machine:
//!
//! ```text
//! (absent) --request--> Pending --decoded--> ReadyForGpuUpload --upload--> ReadyToRender
//!                           \--error-------> Failed
//! ```
//!
//! Cache reads and decoding run on a small worker pool; all HTTP traffic runs
//! on one dedicated thread owning the blocking client; GPU uploads happen
//! only on the render thread via [`TileLoader::upload_pending`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::cache::TileCache;
use super::geometry::GeometryDecoder;
use super::mvt::{self, StagedLayer, StagedTile};
use super::renderer::ResourceUpdateBatch;
use super::tile::TileCoord;

const TILE_CONTENT_TYPE: &str = "application/x-protobuf";
const USER_AGENT: &str = concat!("vectormap/", env!("CARGO_PKG_VERSION"));

/// A tile whose mesh data lives in GPU buffers.
pub struct ReadyTile {
    /// All vertices of this tile, across every layer and feature.
    pub vertex_buffer: wgpu::Buffer,
    /// All triangle indices of this tile, across every layer and feature.
    pub index_buffer: wgpu::Buffer,
    pub layers: Vec<StagedLayer>,
}

enum TileState<R> {
    Pending,
    ReadyForGpuUpload(StagedTile),
    ReadyToRender(R),
    Failed,
}

/// Per-state entry counts, for the HUD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub pending: usize,
    pub ready_for_upload: usize,
    pub ready: usize,
    pub failed: usize,
}

/// The tile state map. Generic over the render payload so the state machine
/// is exercisable without a GPU device.
struct TileStore<R> {
    tiles: HashMap<TileCoord, TileState<R>>,
}

impl<R: Clone> TileStore<R> {
    fn new() -> Self {
        Self {
            tiles: HashMap::new(),
        }
    }

    /// Deduplicate `coords`, return the ready subset, and insert every absent
    /// coordinate as `Pending`, listing it for loading.
    fn request(&mut self, coords: &[TileCoord]) -> (HashMap<TileCoord, R>, Vec<TileCoord>) {
        let mut ready = HashMap::new();
        let mut to_load = Vec::new();
        for &coord in coords {
            match self.tiles.get(&coord) {
                Some(TileState::ReadyToRender(tile)) => {
                    ready.insert(coord, tile.clone());
                }
                // Pending, awaiting upload, or failed: nothing to do.
                Some(_) => {}
                None => {
                    self.tiles.insert(coord, TileState::Pending);
                    to_load.push(coord);
                }
            }
        }
        (ready, to_load)
    }

    /// Pending → ReadyForGpuUpload. Returns false (and leaves the entry
    /// untouched) if the tile is not pending.
    fn mark_decoded(&mut self, coord: TileCoord, staged: StagedTile) -> bool {
        match self.tiles.get_mut(&coord) {
            Some(state @ TileState::Pending) => {
                *state = TileState::ReadyForGpuUpload(staged);
                true
            }
            _ => false,
        }
    }

    /// Pending → Failed. Terminal.
    fn mark_failed(&mut self, coord: TileCoord) -> bool {
        match self.tiles.get_mut(&coord) {
            Some(state @ TileState::Pending) => {
                *state = TileState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Move every `ReadyForGpuUpload` tile to `ReadyToRender` through `f`,
    /// which consumes the staged data and produces the render payload plus
    /// whatever staging memory must outlive the upload batch.
    fn finish_uploads<F, S>(&mut self, mut f: F) -> Vec<S>
    where
        F: FnMut(TileCoord, StagedTile) -> (R, S),
    {
        let mut kept = Vec::new();
        for (&coord, state) in self.tiles.iter_mut() {
            if !matches!(state, TileState::ReadyForGpuUpload(_)) {
                continue;
            }
            let TileState::ReadyForGpuUpload(staged) =
                std::mem::replace(state, TileState::Pending)
            else {
                unreachable!();
            };
            let (ready, staging) = f(coord, staged);
            *state = TileState::ReadyToRender(ready);
            kept.push(staging);
        }
        kept
    }

    fn stats(&self) -> LoaderStats {
        let mut stats = LoaderStats::default();
        for state in self.tiles.values() {
            match state {
                TileState::Pending => stats.pending += 1,
                TileState::ReadyForGpuUpload(_) => stats.ready_for_upload += 1,
                TileState::ReadyToRender(_) => stats.ready += 1,
                TileState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// Result of [`TileLoader::request_tiles`]: the requested tiles that were
/// `ReadyToRender` at the time of the call.
pub struct RequestResult {
    pub tiles: HashMap<TileCoord, Arc<ReadyTile>>,
}

/// Staging memory moved out of the store during an upload. The caller must
/// keep this alive until the update batch has been submitted; dropping it is
/// the only safe point to release the staged vectors.
#[derive(Default)]
pub struct UploadResult {
    pub staged: Vec<UploadItem>,
}

pub struct UploadItem {
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

type TileLoadedCallback = Box<dyn Fn(bool, TileCoord) + Send + Sync>;

/// State shared between the public handle, pool workers and the network
/// thread.
struct LoaderShared {
    store: Mutex<TileStore<Arc<ReadyTile>>>,
    cache: TileCache,
    subscribers: Mutex<Vec<TileLoadedCallback>>,
}

impl LoaderShared {
    /// Fire `tile_loaded`. Called after the state transition is visible.
    fn notify(&self, success: bool, coord: TileCoord) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            subscriber(success, coord);
        }
    }

    fn fail_tile(&self, coord: TileCoord) {
        let failed = self.store.lock().unwrap().mark_failed(coord);
        if failed {
            self.notify(false, coord);
        }
    }
}

enum Job {
    /// Look the tile up in the disk cache, decoding on a hit and deferring to
    /// the network thread on a miss.
    Load(TileCoord),
    /// Decode fetched bytes; `write_back` stores them through the cache.
    Decode {
        coord: TileCoord,
        bytes: Vec<u8>,
        write_back: bool,
    },
}

/// Round-robin dispatch handle over the worker channels.
#[derive(Clone)]
struct PoolHandle {
    senders: Arc<Vec<mpsc::Sender<Job>>>,
    next: Arc<AtomicUsize>,
}

impl PoolHandle {
    fn dispatch(&self, job: Job) {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let _ = self.senders[worker].send(job);
    }
}

/// Thread-safe tile loader. Create once, share via `Arc`.
pub struct TileLoader {
    shared: Arc<LoaderShared>,
    pool: PoolHandle,
    _worker_handles: Vec<JoinHandle<()>>,
    _network_handle: JoinHandle<()>,
}

impl TileLoader {
    /// Spawn the worker pool and the network thread. `api_key` is the
    /// MapTiler key resolved at startup; it is never re-read from the
    /// environment.
    pub fn new(api_key: String, cache: TileCache, worker_count: usize) -> Self {
        let shared = Arc::new(LoaderShared {
            store: Mutex::new(TileStore::new()),
            cache,
            subscribers: Mutex::new(Vec::new()),
        });

        let (net_tx, net_rx) = mpsc::channel::<TileCoord>();

        let mut senders = Vec::new();
        let mut worker_handles = Vec::new();
        for id in 0..worker_count.max(1) {
            let (job_tx, job_rx) = mpsc::channel::<Job>();
            senders.push(job_tx);
            let shared = Arc::clone(&shared);
            let net_tx = net_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tile-worker-{id}"))
                .spawn(move || worker_thread(shared, net_tx, job_rx))
                .expect("Failed to spawn tile worker");
            worker_handles.push(handle);
        }

        let pool = PoolHandle {
            senders: Arc::new(senders),
            next: Arc::new(AtomicUsize::new(0)),
        };

        let network_handle = {
            let shared = Arc::clone(&shared);
            let pool = pool.clone();
            std::thread::Builder::new()
                .name("tile-network".to_string())
                .spawn(move || network_thread(shared, pool, api_key, net_rx))
                .expect("Failed to spawn network thread")
        };

        Self {
            shared,
            pool,
            _worker_handles: worker_handles,
            _network_handle: network_handle,
        }
    }

    /// Subscribe to `tile_loaded(success, coord)` events. Fired from worker
    /// threads once a tile reaches `ReadyForGpuUpload` or `Failed`.
    pub fn on_tile_loaded(&self, callback: impl Fn(bool, TileCoord) + Send + Sync + 'static) {
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .push(Box::new(callback));
    }

    /// Return the requested tiles that are ready to render and kick off
    /// loading for any coordinate not yet known. Never blocks on I/O.
    pub fn request_tiles(&self, coords: &[TileCoord]) -> RequestResult {
        let (ready, to_load) = self.shared.store.lock().unwrap().request(coords);

        if !to_load.is_empty() {
            log::debug!("requesting {} new tiles", to_load.len());
        }
        for coord in to_load {
            self.pool.dispatch(Job::Load(coord));
        }

        RequestResult { tiles: ready }
    }

    /// Render-thread only: create GPU buffers for every decoded tile,
    /// record their uploads into `batch` and transition them to
    /// `ReadyToRender`. The returned staging memory must outlive the batch
    /// submission.
    pub fn upload_pending(
        &self,
        device: &wgpu::Device,
        batch: &mut ResourceUpdateBatch<'_>,
    ) -> UploadResult {
        let mut store = self.shared.store.lock().unwrap();
        let staged = store.finish_uploads(|coord, staged| {
            let StagedTile {
                layers,
                vertices,
                indices,
            } = staged;

            let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
            let vertex_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Tile Vertex Buffer"),
                size: vertex_bytes.len() as u64,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            batch.upload_static_buffer(&vertex_buffer, vertex_bytes);

            let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
            let index_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Tile Index Buffer"),
                size: index_bytes.len() as u64,
                usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            batch.upload_static_buffer(&index_buffer, index_bytes);

            log::debug!("uploaded tile {coord}");

            let ready = Arc::new(ReadyTile {
                vertex_buffer,
                index_buffer,
                layers,
            });
            (ready, UploadItem { vertices, indices })
        });

        UploadResult { staged }
    }

    pub fn stats(&self) -> LoaderStats {
        self.shared.store.lock().unwrap().stats()
    }
}

fn worker_thread(
    shared: Arc<LoaderShared>,
    net_tx: mpsc::Sender<TileCoord>,
    jobs: mpsc::Receiver<Job>,
) {
    // One decoder per worker; its tessellator scratch is reused across tiles.
    let mut decoder = GeometryDecoder::new();

    for job in jobs.iter() {
        match job {
            Job::Load(coord) => match shared.cache.lookup(coord) {
                Some(bytes) => decode_and_publish(&shared, &mut decoder, coord, &bytes, false),
                None => {
                    if net_tx.send(coord).is_err() {
                        shared.fail_tile(coord);
                    }
                }
            },
            Job::Decode {
                coord,
                bytes,
                write_back,
            } => decode_and_publish(&shared, &mut decoder, coord, &bytes, write_back),
        }
    }
}

fn decode_and_publish(
    shared: &LoaderShared,
    decoder: &mut GeometryDecoder,
    coord: TileCoord,
    bytes: &[u8],
    write_back: bool,
) {
    match mvt::decode_tile(bytes, decoder) {
        Ok(staged) => {
            let decoded = shared.store.lock().unwrap().mark_decoded(coord, staged);
            if decoded {
                shared.notify(true, coord);
            } else {
                log::warn!("decoded tile {coord} was not in the pending state");
            }
        }
        Err(err) => {
            log::warn!("failed to decode tile {coord}: {err}");
            shared.fail_tile(coord);
        }
    }

    if write_back {
        // Losing the race to another writer is fine; other errors just cost
        // us a re-download next run.
        if let Err(err) = shared.cache.store(coord, bytes) {
            log::warn!("failed to cache tile {coord}: {err}");
        }
    }
}

fn network_thread(
    shared: Arc<LoaderShared>,
    pool: PoolHandle,
    api_key: String,
    requests: mpsc::Receiver<TileCoord>,
) {
    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .expect("Failed to create HTTP client");

    for coord in requests.iter() {
        let url = coord.to_tile_url(&api_key);
        let response = match client.get(&url).send() {
            Ok(response) => response,
            Err(err) => {
                log::warn!("download failed for tile {coord}: {err}");
                shared.fail_tile(coord);
                continue;
            }
        };

        if !response.status().is_success() {
            log::warn!("tile {coord} request returned HTTP {}", response.status());
            shared.fail_tile(coord);
            continue;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with(TILE_CONTENT_TYPE) {
            log::warn!("tile {coord} has unexpected content type {content_type:?}");
            shared.fail_tile(coord);
            continue;
        }

        match response.bytes() {
            Ok(bytes) => pool.dispatch(Job::Decode {
                coord,
                bytes: bytes.to_vec(),
                write_back: true,
            }),
            Err(err) => {
                log::warn!("failed to read tile {coord} response: {err}");
                shared.fail_tile(coord);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::mvt::StagedFeature;

    fn staged_tile() -> StagedTile {
        StagedTile {
            layers: vec![StagedLayer {
                name: "water".to_string(),
                extent: 4096,
                features: vec![StagedFeature {
                    vtx_byte_offset: 0,
                    idx_byte_offset: 0,
                    idx_count: 3,
                    metadata: HashMap::new(),
                }],
            }],
            vertices: vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn test_request_inserts_pending_once() {
        let mut store: TileStore<u32> = TileStore::new();
        let coord = TileCoord::new(1, 0, 0);

        let (ready, to_load) = store.request(&[coord, coord]);
        assert!(ready.is_empty());
        // Duplicates within one call collapse to one load job.
        assert_eq!(to_load, vec![coord]);

        // A repeated request issues no new jobs.
        let (ready, to_load) = store.request(&[coord]);
        assert!(ready.is_empty());
        assert!(to_load.is_empty());
    }

    #[test]
    fn test_decoded_then_uploaded_becomes_ready() {
        let mut store: TileStore<u32> = TileStore::new();
        let coord = TileCoord::new(2, 1, 1);
        store.request(&[coord]);

        assert!(store.mark_decoded(coord, staged_tile()));
        assert_eq!(store.stats().ready_for_upload, 1);

        let staging = store.finish_uploads(|_, staged| (7u32, staged.vertices.len()));
        assert_eq!(staging, vec![3]);
        assert_eq!(
            store.stats(),
            LoaderStats {
                ready: 1,
                ..Default::default()
            }
        );

        // Now the tile comes back from request, and a second upload pass
        // finds nothing.
        let (ready, to_load) = store.request(&[coord]);
        assert_eq!(ready.get(&coord), Some(&7));
        assert!(to_load.is_empty());
        assert!(store.finish_uploads(|_, _| (0u32, ())).is_empty());
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut store: TileStore<u32> = TileStore::new();
        let coord = TileCoord::new(3, 2, 2);
        store.request(&[coord]);

        assert!(store.mark_failed(coord));
        assert_eq!(store.stats().failed, 1);

        // No transitions out of Failed.
        assert!(!store.mark_decoded(coord, staged_tile()));
        assert!(!store.mark_failed(coord));
        let (ready, to_load) = store.request(&[coord]);
        assert!(ready.is_empty());
        assert!(to_load.is_empty());
    }

    #[test]
    fn test_transitions_require_pending() {
        let mut store: TileStore<u32> = TileStore::new();
        let coord = TileCoord::new(1, 1, 0);

        // Unknown coordinate: nothing to transition.
        assert!(!store.mark_decoded(coord, staged_tile()));
        assert!(!store.mark_failed(coord));

        store.request(&[coord]);
        assert!(store.mark_decoded(coord, staged_tile()));
        // Already decoded; a second decode or failure must not regress it.
        assert!(!store.mark_decoded(coord, staged_tile()));
        assert!(!store.mark_failed(coord));
        assert_eq!(store.stats().ready_for_upload, 1);
    }

    #[test]
    fn test_cache_hit_reaches_ready_for_upload() {
        use crate::map::mvt::{Feature, GeomType, Layer, Tile};
        use prost::Message;

        // A minimal valid tile: one square polygon in one layer.
        let tile = Tile {
            layers: vec![Layer {
                version: 2,
                name: "water".to_string(),
                features: vec![Feature {
                    id: Some(1),
                    tags: Vec::new(),
                    r#type: Some(GeomType::Polygon as i32),
                    geometry: vec![9, 0, 0, 26, 20, 0, 0, 20, 19, 0, 15],
                }],
                keys: Vec::new(),
                values: Vec::new(),
                extent: 4096,
            }],
        };

        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::new(dir.path().to_path_buf(), "maptiler_planet");
        let coord = TileCoord::new(0, 0, 0);
        cache.store(coord, &tile.encode_to_vec()).unwrap();

        let loader = TileLoader::new("test-key".to_string(), cache, 2);
        let (event_tx, event_rx) = mpsc::channel();
        loader.on_tile_loaded(move |success, coord| {
            let _ = event_tx.send((success, coord));
        });

        let result = loader.request_tiles(&[coord]);
        assert!(result.tiles.is_empty());

        let (success, loaded_coord) = event_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("tile_loaded should fire");
        assert!(success);
        assert_eq!(loaded_coord, coord);
        assert_eq!(loader.stats().ready_for_upload, 1);

        // Still not renderable until upload_pending runs on the render thread.
        let result = loader.request_tiles(&[coord]);
        assert!(result.tiles.is_empty());
    }
}
