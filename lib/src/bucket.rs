use crate::haar::{Signature, NUM_CHANNELS, NUM_PIXELS_SQUARED};
use crate::IqdbId;

const INLINE_CAP: usize = 7;

/// One id-list of the inverted index. Almost every bucket is empty and most
/// of the rest hold a handful of ids, so the list only spills to the heap
/// once the inline array is full.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum Bucket {
    #[default]
    Empty,
    Inline {
        len: u8,
        ids: [IqdbId; INLINE_CAP],
    },
    Spilled(Vec<IqdbId>),
}

impl Bucket {
    pub(crate) fn push(&mut self, id: IqdbId) {
        match self {
            Bucket::Empty => {
                let mut ids = [0; INLINE_CAP];
                ids[0] = id;
                *self = Bucket::Inline { len: 1, ids };
            }
            Bucket::Inline { len, ids } => {
                if (*len as usize) < INLINE_CAP {
                    ids[*len as usize] = id;
                    *len += 1;
                } else {
                    let mut spilled = ids.to_vec();
                    spilled.push(id);
                    *self = Bucket::Spilled(spilled);
                }
            }
            Bucket::Spilled(ids) => ids.push(id),
        }
    }

    /// Erase every occurrence of `id`.
    pub(crate) fn erase(&mut self, id: IqdbId) {
        match self {
            Bucket::Empty => {}
            Bucket::Inline { len, ids } => {
                let mut kept = 0;
                for i in 0..*len as usize {
                    if ids[i] != id {
                        ids[kept] = ids[i];
                        kept += 1;
                    }
                }
                if kept == 0 {
                    *self = Bucket::Empty;
                } else {
                    ids[kept..].fill(0);
                    *len = kept as u8;
                }
            }
            Bucket::Spilled(ids) => {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    *self = Bucket::Empty;
                }
            }
        }
    }

    pub(crate) fn ids(&self) -> &[IqdbId] {
        match self {
            Bucket::Empty => &[],
            Bucket::Inline { len, ids } => &ids[..*len as usize],
            Bucket::Spilled(ids) => ids,
        }
    }
}

/// The inverted index: one bucket per `(channel, sign, magnitude)` triple.
pub(crate) struct BucketSet {
    buckets: [[Vec<Bucket>; 2]; NUM_CHANNELS],
}

impl BucketSet {
    pub(crate) fn new() -> Self {
        let magnitudes = vec![Bucket::Empty; NUM_PIXELS_SQUARED];
        let signs = [(); 2].map(|_| magnitudes.clone());
        Self {
            buckets: [(); NUM_CHANNELS].map(|_| signs.clone()),
        }
    }

    pub(crate) fn at(&self, channel: usize, coef: i16) -> &Bucket {
        let sign = coef < 0;
        &self.buckets[channel][sign as usize][coef.unsigned_abs() as usize]
    }

    fn at_mut(&mut self, channel: usize, coef: i16) -> &mut Bucket {
        let sign = coef < 0;
        &mut self.buckets[channel][sign as usize][coef.unsigned_abs() as usize]
    }

    /// Append `id` to every bucket the signature touches.
    pub(crate) fn add(&mut self, sig: &Signature, id: IqdbId) {
        for (channel, coef) in sig.each_coef() {
            self.at_mut(channel, coef).push(id);
        }
    }

    /// Excise `id` from every bucket the signature touches.
    pub(crate) fn remove(&mut self, sig: &Signature, id: IqdbId) {
        for (channel, coef) in sig.each_coef() {
            self.at_mut(channel, coef).erase(id);
        }
    }
}
