use std::collections::BinaryHeap;

use bucket::BucketSet;
pub use error::{Error, Result};
pub use haar::Signature;
pub use sql::ImageRecord;
use sql::SqlDb;

mod bucket;
mod error;
mod haar;
mod sql;

/// Internal id assigned by the catalog; indexes the info table and buckets.
pub type IqdbId = u32;
/// Externally meaningful id supplied by the client.
pub type PostId = u32;

/// Per-bin, per-channel score weights. Together with the magnitude bins
/// below these determine every score this index produces; they are part of
/// the compatibility surface and must not be tuned.
const WEIGHTS: [[f32; 3]; 6] = [
    [5.00, 19.21, 34.37],
    [0.83, 1.26, 0.36],
    [1.01, 0.44, 0.45],
    [0.52, 0.53, 0.14],
    [0.47, 0.28, 0.18],
    [0.30, 0.14, 0.27],
];

/// Coarse weight bin for a coefficient magnitude: `min(max(y, x), 5)` of
/// the 128x128 grid cell the magnitude addresses.
fn coef_bin(magnitude: u16) -> usize {
    ((magnitude / 128).max(magnitude % 128)).min(5) as usize
}

/// Slack added whenever the info table has to grow, so consecutive ids
/// don't reallocate it one slot at a time.
const GROWTH_SLACK: usize = 50_000;

/// What the index remembers about one live image without touching disk.
/// A vacant slot is a tombstone: removal leaves the id allocated for the
/// rest of the session.
#[derive(Clone, Copy, Debug)]
struct ImageInfo {
    post_id: PostId,
    avgl: [f32; 3],
}

/// One query result, most similar when the score is highest (an exact
/// self-match normalizes to 100).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Match {
    pub post_id: PostId,
    pub score: f32,
}

/// The similarity index: the durable catalog plus the two in-memory
/// projections (inverted coefficient buckets and the dense info table)
/// that answer queries without I/O.
///
/// The struct itself does no locking beyond the catalog's internal mutex;
/// callers serve it behind a readers-writer lock, taking shared access for
/// `query`/`image_count`/lookups and exclusive access for mutation.
pub struct DB {
    sql: SqlDb,
    buckets: BucketSet,
    info: Vec<Option<ImageInfo>>,
    live: usize,
    last_post_id: PostId,
}

impl DB {
    /// Open the catalog at `path` (`":memory:"` for ephemeral) and rebuild
    /// the in-memory index from it.
    pub fn open(path: &str) -> Result<Self> {
        let mut db = Self {
            sql: SqlDb::open(path)?,
            buckets: BucketSet::new(),
            info: Vec::new(),
            live: 0,
            last_post_id: 0,
        };
        db.load()?;
        Ok(db)
    }

    /// Rebuild buckets and info table from the catalog. Records whose
    /// signature blob cannot be parsed are skipped with a warning; the
    /// catalog is authoritative and a bad row should not take the whole
    /// index down.
    fn load(&mut self) -> Result<()> {
        let mut buckets = BucketSet::new();
        let mut info = Vec::new();
        let mut live = 0;
        self.sql.for_each(|record| match record {
            Ok(record) => {
                register(&mut buckets, &mut info, &mut live, record.id, record.post_id, &record.signature);
                if record.id % 250_000 == 0 {
                    tracing::info!(id = record.id, post_id = record.post_id, "loading images...");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "skipping unreadable image record");
            }
        })?;
        self.buckets = buckets;
        self.info = info;
        self.live = live;
        self.last_post_id = self.sql.max_post_id()?;
        tracing::info!(images = self.live, "loaded image database");
        Ok(())
    }

    /// Number of live images.
    pub fn image_count(&self) -> usize {
        self.live
    }

    /// High-water mark of post ids; `last_post_id() + 1` is the next
    /// auto-assigned id.
    pub fn last_post_id(&self) -> PostId {
        self.last_post_id
    }

    pub fn get_image(&self, post_id: PostId) -> Result<Option<ImageRecord>> {
        self.sql.get_by_post(post_id)
    }

    pub fn get_image_by_md5(&self, md5: &str) -> Result<Option<ImageRecord>> {
        self.sql.get_by_md5(md5)
    }

    /// Add an image. The catalog commit happens first; the in-memory index
    /// is only touched once an internal id exists, so a failed insert
    /// leaves every structure untouched.
    pub fn add(
        &mut self,
        post_id: PostId,
        md5: &str,
        signature: &Signature,
        replace: bool,
    ) -> Result<IqdbId> {
        if replace {
            self.remove_by_post(post_id)?;
        }
        let id = match self.sql.insert(post_id, md5, signature) {
            Ok(id) => id,
            Err(Error::PostIdConflict(post_id)) => {
                // Someone else owns this id; resynchronize the counter so
                // auto-assignment cannot keep colliding.
                self.last_post_id = self.sql.max_post_id()?;
                return Err(Error::PostIdConflict(post_id));
            }
            Err(error) => return Err(error),
        };
        register(&mut self.buckets, &mut self.info, &mut self.live, id, post_id, signature);
        self.last_post_id = self.last_post_id.max(post_id);
        tracing::debug!(post_id, id, "added image");
        Ok(id)
    }

    /// Remove by post id. Returns `false` when the post is not in the
    /// catalog.
    pub fn remove_by_post(&mut self, post_id: PostId) -> Result<bool> {
        match self.sql.get_by_post(post_id)? {
            Some(record) => self.unregister(&record).map(|()| true),
            None => Ok(false),
        }
    }

    /// Remove by md5. Returns `false` when the digest is not in the
    /// catalog.
    pub fn remove_by_md5(&mut self, md5: &str) -> Result<bool> {
        match self.sql.get_by_md5(md5)? {
            Some(record) => self.unregister(&record).map(|()| true),
            None => Ok(false),
        }
    }

    fn unregister(&mut self, record: &ImageRecord) -> Result<()> {
        self.buckets.remove(&record.signature, record.id);
        if let Some(slot) = self.info.get_mut(record.id as usize) {
            if slot.take().is_some() {
                self.live -= 1;
            }
        }
        self.sql.delete_by_post(record.post_id)?;
        self.last_post_id = self
            .sql
            .max_post_id()?
            .max(self.last_post_id.saturating_sub(1));
        tracing::debug!(post_id = record.post_id, id = record.id, "removed image");
        Ok(())
    }

    /// Fingerprint `blob` and query with the result.
    pub fn query_from_blob(&self, blob: &[u8], numres: usize) -> Result<Vec<Match>> {
        let signature = Signature::from_blob(blob)?;
        Ok(self.query(&signature, numres))
    }

    /// The `numres` most similar live images, most similar first.
    ///
    /// Scores start from the weighted DC distance and every bucket the
    /// probe's coefficients hit subtracts that coefficient's weight from
    /// its members, so raw scores sink as images match. `scale` collects
    /// the same subtractions, and the final `100 / scale` rescale maps an
    /// exact match to 100.
    pub fn query(&self, signature: &Signature, numres: usize) -> Vec<Match> {
        if numres == 0 || self.live == 0 {
            return Vec::new();
        }

        let mut scale = 0.0f32;
        let mut scores = vec![0.0f32; self.info.len()];

        for (i, slot) in self.info.iter().enumerate() {
            let Some(info) = slot else { continue };
            let mut score = 0.0;
            for channel in 0..signature.num_channels() {
                score += WEIGHTS[0][channel]
                    * (info.avgl[channel] - signature.avglf[channel] as f32).abs();
            }
            scores[i] = score;
        }

        for (channel, coef) in signature.each_coef() {
            let ids = self.buckets.at(channel, coef).ids();
            if ids.is_empty() {
                continue;
            }
            let weight = WEIGHTS[coef_bin(coef.unsigned_abs())][channel];
            scale -= weight;
            for &id in ids {
                scores[id as usize] -= weight;
            }
        }

        // Bounded selection: a worst-at-top heap of the best `numres`
        // candidates, so the scan stays O(n log k).
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(numres);
        for (i, slot) in self.info.iter().enumerate() {
            if slot.is_none() {
                continue;
            }
            let candidate = Candidate {
                id: i as IqdbId,
                score: scores[i],
            };
            if heap.len() < numres {
                heap.push(candidate);
            } else if let Some(worst) = heap.peek() {
                if candidate.score < worst.score {
                    heap.pop();
                    heap.push(candidate);
                }
            }
        }

        if scale != 0.0 {
            scale = 1.0 / scale;
        }

        let mut matches = Vec::with_capacity(heap.len());
        while let Some(Candidate { id, score }) = heap.pop() {
            let Some(info) = &self.info[id as usize] else { continue };
            matches.push(Match {
                post_id: info.post_id,
                score: score * 100.0 * scale,
            });
        }
        matches.reverse();
        matches
    }
}

/// Register an image in the in-memory structures under its catalog id.
/// Used both by `add` and by the startup reload, which replays stored ids
/// without reassignment.
fn register(
    buckets: &mut BucketSet,
    info: &mut Vec<Option<ImageInfo>>,
    live: &mut usize,
    id: IqdbId,
    post_id: PostId,
    signature: &Signature,
) {
    let slot = id as usize;
    if slot >= info.len() {
        info.resize(slot + GROWTH_SLACK, None);
    }
    info[slot] = Some(ImageInfo {
        post_id,
        avgl: signature.avglf.map(|avglf| avglf as f32),
    });
    buckets.add(signature, id);
    *live += 1;
}

struct Candidate {
    id: IqdbId,
    score: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.total_cmp(&other.score)
    }
}
