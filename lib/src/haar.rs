use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgba};

use crate::error::{Error, Result};

pub(crate) const NUM_PIXELS: usize = 128;
pub(crate) const NUM_PIXELS_SQUARED: usize = NUM_PIXELS * NUM_PIXELS;
pub(crate) const NUM_COEFS: usize = 40;
pub(crate) const NUM_CHANNELS: usize = 3;

const HASH_PREFIX: &str = "iqdb_";
const HASH_LEN: usize = HASH_PREFIX.len() + 3 * 16 + NUM_CHANNELS * NUM_COEFS * 4;
const BLOB_LEN: usize = NUM_CHANNELS * NUM_COEFS * 2;

/// A Haar-wavelet fingerprint of one image: the DC coefficient of each YIQ
/// channel plus the 40 largest-magnitude AC coefficients per channel, each
/// stored as a signed grid index (`y * 128 + x`, negated when the wavelet
/// coefficient is non-positive).
///
/// Rows are kept sorted so duplicate coefficients are adjacent and the
/// portable forms are canonical.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub avglf: [f64; 3],
    pub sig: [[i16; NUM_COEFS]; NUM_CHANNELS],
}

impl Signature {
    /// Fingerprint a raw image blob. The format is detected from the magic
    /// bytes; anything that is not JPEG, PNG, GIF or BMP is rejected before
    /// decoding is attempted.
    pub fn from_blob(blob: &[u8]) -> Result<Signature> {
        let format = sniff_format(blob)?;
        let img = image::load_from_memory_with_format(blob, format)
            .map_err(|error| Error::DecodeFailure(error.to_string()))?;
        Ok(Self::from_image(&img))
    }

    /// Fingerprint an already-decoded image.
    pub fn from_image(img: &DynamicImage) -> Signature {
        let img = resized(img);

        let mut a = vec![0.0; NUM_PIXELS_SQUARED];
        let mut b = vec![0.0; NUM_PIXELS_SQUARED];
        let mut c = vec![0.0; NUM_PIXELS_SQUARED];
        for (index, pixel) in img.pixels().enumerate() {
            a[index] = pixel[0] as f64;
            b[index] = pixel[1] as f64;
            c[index] = pixel[2] as f64;
        }

        rgb_to_yiq(&mut a, &mut b, &mut c);
        haar_2d(&mut a);
        haar_2d(&mut b);
        haar_2d(&mut c);
        // DC is normalized; the AC coefficients are only ever compared by
        // magnitude so they stay unscaled.
        a[0] /= 256.0 * 128.0;
        b[0] /= 256.0 * 128.0;
        c[0] /= 256.0 * 128.0;

        let avglf = [a[0], b[0], c[0]];
        let mut sig = [largest_coefs(&a), largest_coefs(&b), largest_coefs(&c)];
        for row in &mut sig {
            row.sort_unstable();
        }

        let mut signature = Signature { avglf, sig };
        if signature.is_grayscale() {
            signature.sig[1] = [0; NUM_COEFS];
            signature.sig[2] = [0; NUM_COEFS];
        }
        signature
    }

    /// Rebuild a signature from the catalog's column values.
    pub fn from_parts(avglf: [f64; 3], blob: &[u8]) -> Result<Signature> {
        if blob.len() != BLOB_LEN {
            return Err(Error::BadSignatureBlob(blob.len()));
        }
        let mut sig = [[0i16; NUM_COEFS]; NUM_CHANNELS];
        for (i, bytes) in blob.chunks_exact(2).enumerate() {
            let coef = i16::from_le_bytes([bytes[0], bytes[1]]);
            if !valid_coef(coef) {
                return Err(Error::BadRow);
            }
            sig[i / NUM_COEFS][i % NUM_COEFS] = coef;
        }
        for row in &mut sig {
            row.sort_unstable();
        }
        Ok(Signature { avglf, sig })
    }

    /// The 240-byte little-endian packing stored in the catalog.
    pub fn to_blob(&self) -> Vec<u8> {
        self.sig
            .iter()
            .flatten()
            .flat_map(|coef| coef.to_le_bytes())
            .collect()
    }

    /// A signature with zero I/Q DC coefficients only carries luminance
    /// information; its chroma rows are zero-filled and skipped everywhere.
    pub fn is_grayscale(&self) -> bool {
        self.avglf[1] == 0.0 && self.avglf[2] == 0.0
    }

    pub fn num_channels(&self) -> usize {
        if self.is_grayscale() {
            1
        } else {
            NUM_CHANNELS
        }
    }

    /// The union of `(channel, coefficient)` pairs in this signature.
    /// Rows are sorted, so a duplicated coefficient is adjacent and
    /// enumerated once.
    pub(crate) fn each_coef(&self) -> impl Iterator<Item = (usize, i16)> + '_ {
        (0..self.num_channels()).flat_map(move |channel| {
            let row = &self.sig[channel];
            row.iter()
                .enumerate()
                .filter(move |&(i, coef)| i == 0 || row[i - 1] != *coef)
                .map(move |(_, &coef)| (channel, coef))
        })
    }
}

/// The 533-character portable form: `iqdb_`, 16 hex digits per DC double
/// (IEEE-754 bit pattern), then 4 hex digits per coefficient.
impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(HASH_PREFIX)?;
        for avglf in self.avglf {
            write!(f, "{:016x}", avglf.to_bits())?;
        }
        for coef in self.sig.iter().flatten() {
            write!(f, "{:04x}", *coef as u16)?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Signature> {
        let hex = s.strip_prefix(HASH_PREFIX).ok_or(Error::InvalidHash)?;
        if s.len() != HASH_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash);
        }

        let mut avglf = [0.0; 3];
        for (i, avglf) in avglf.iter_mut().enumerate() {
            let bits = u64::from_str_radix(&hex[i * 16..(i + 1) * 16], 16)
                .map_err(|_| Error::InvalidHash)?;
            *avglf = f64::from_bits(bits);
        }

        let mut sig = [[0i16; NUM_COEFS]; NUM_CHANNELS];
        let coefs = &hex[3 * 16..];
        for i in 0..NUM_CHANNELS * NUM_COEFS {
            let bits = u16::from_str_radix(&coefs[i * 4..(i + 1) * 4], 16)
                .map_err(|_| Error::InvalidHash)?;
            let coef = bits as i16;
            if !valid_coef(coef) {
                return Err(Error::InvalidHash);
            }
            sig[i / NUM_COEFS][i % NUM_COEFS] = coef;
        }
        for row in &mut sig {
            row.sort_unstable();
        }
        Ok(Signature { avglf, sig })
    }
}

/// A coefficient addresses a 128x128 grid cell; anything outside that
/// range would index past the bucket array.
fn valid_coef(coef: i16) -> bool {
    (coef.unsigned_abs() as usize) < NUM_PIXELS_SQUARED
}

fn sniff_format(blob: &[u8]) -> Result<ImageFormat> {
    match blob {
        [0xff, 0xd8, 0xff, ..] => Ok(ImageFormat::Jpeg),
        [0x89, b'P', b'N', b'G', ..] => Ok(ImageFormat::Png),
        [b'G', b'I', b'F', ..] => Ok(ImageFormat::Gif),
        [b'B', b'M', ..] => Ok(ImageFormat::Bmp),
        _ => Err(Error::UnsupportedFormat),
    }
}

fn rgb_to_yiq(r: &mut [f64], g: &mut [f64], b: &mut [f64]) {
    for i in 0..NUM_PIXELS_SQUARED {
        let y = 0.299 * r[i] + 0.587 * g[i] + 0.114 * b[i];
        let i_ = 0.596 * r[i] - 0.275 * g[i] - 0.321 * b[i];
        let q = 0.212 * r[i] - 0.523 * g[i] + 0.311 * b[i];
        r[i] = y;
        g[i] = i_;
        b[i] = q;
    }
}

/// One full 1D Haar decomposition of 128 samples starting at `base` and
/// `stride` apart. Differences pick up the cumulative 0.7071 scaling of
/// their level; sums stay unscaled until the DC sample at the end.
#[allow(clippy::approx_constant)]
fn haar_1d(data: &mut [f64], base: usize, stride: usize) {
    let mut temp = [0.0; NUM_PIXELS / 2];
    let mut scale = 1.0;
    let mut len = NUM_PIXELS;
    while len > 1 {
        let half = len / 2;
        scale *= 0.7071;
        for k in 0..half {
            let even = data[base + 2 * k * stride];
            let odd = data[base + (2 * k + 1) * stride];
            temp[k] = (even - odd) * scale;
            data[base + k * stride] = even + odd;
        }
        for k in 0..half {
            data[base + (half + k) * stride] = temp[k];
        }
        len = half;
    }
    data[base] *= scale;
}

fn haar_2d(a: &mut [f64]) {
    for row in 0..NUM_PIXELS {
        haar_1d(a, row * NUM_PIXELS, 1);
    }
    for col in 0..NUM_PIXELS {
        haar_1d(a, col, NUM_PIXELS);
    }
}

/// Select the `NUM_COEFS` largest-magnitude AC coefficients, encoding each
/// as its grid index with the coefficient's sign.
fn largest_coefs(data: &[f64]) -> [i16; NUM_COEFS] {
    struct Coef {
        index: usize,
        magnitude: f64,
    }
    impl PartialEq for Coef {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == std::cmp::Ordering::Equal
        }
    }
    impl Eq for Coef {}
    impl PartialOrd for Coef {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Coef {
        // Reversed so the heap keeps its smallest magnitude on top.
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.magnitude.total_cmp(&other.magnitude).reverse()
        }
    }

    let mut heap = BinaryHeap::with_capacity(NUM_COEFS);
    for index in 1..=NUM_COEFS {
        heap.push(Coef {
            index,
            magnitude: data[index].abs(),
        });
    }
    for index in NUM_COEFS + 1..NUM_PIXELS_SQUARED {
        let magnitude = data[index].abs();
        if magnitude > heap.peek().map_or(0.0, |min| min.magnitude) {
            heap.pop();
            heap.push(Coef { index, magnitude });
        }
    }

    let mut sig = [0; NUM_COEFS];
    for (slot, coef) in sig.iter_mut().zip(heap.into_iter()) {
        *slot = if data[coef.index] <= 0.0 {
            -(coef.index as i16)
        } else {
            coef.index as i16
        };
    }
    sig
}

/// Area-averaging resample to the 128x128 analysis grid, weighting source
/// pixels by coverage. Alpha is folded in the same way the rest of the
/// pipeline has always done it, with 127 as the opaque ceiling.
fn resized(img: &DynamicImage) -> ImageBuffer<Rgba<u8>, Vec<u8>> {
    const ALPHA_MAX: u8 = 127;
    let (src_w, src_h) = (img.width() as f32, img.height() as f32);
    let mut dst = ImageBuffer::new(NUM_PIXELS as u32, NUM_PIXELS as u32);

    for y in 0..NUM_PIXELS {
        for x in 0..NUM_PIXELS {
            let (mut red, mut green, mut blue, mut alpha) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
            let (mut alpha_sum, mut contrib_sum) = (0.0f32, 0.0f32);
            let mut covered = 0.0f32;

            let sy1 = y as f32 * src_h / NUM_PIXELS as f32;
            let sy2 = (y + 1) as f32 * src_h / NUM_PIXELS as f32;
            let sx1 = x as f32 * src_w / NUM_PIXELS as f32;
            let sx2 = (x + 1) as f32 * src_w / NUM_PIXELS as f32;

            let mut sy = sy1;
            while sy < sy2 {
                let mut yportion = 1.0;
                if sy.floor() == sy1.floor() {
                    yportion = (1.0 - (sy - sy.floor())).min(sy2 - sy1);
                    sy = sy.floor();
                } else if sy == sy2.floor() {
                    yportion = sy2 - sy2.floor();
                }

                let mut sx = sx1;
                while sx < sx2 {
                    let mut xportion = 1.0;
                    if sx.floor() == sx1.floor() {
                        xportion = (1.0 - (sx - sx.floor())).min(sx2 - sx1);
                        sx = sx.floor();
                    } else if sx == sx2.floor() {
                        xportion = sx2 - sx2.floor();
                    }

                    let contribution = xportion * yportion;
                    let Rgba([r, g, b, a]) = img.get_pixel(sx as u32, sy as u32);
                    let alpha_factor = (ALPHA_MAX - a) as f32 * contribution;
                    red += r as f32 * alpha_factor;
                    green += g as f32 * alpha_factor;
                    blue += b as f32 * alpha_factor;
                    alpha += a as f32 * alpha_factor;
                    alpha_sum += alpha_factor;
                    contrib_sum += contribution;
                    covered += contribution;
                    sx += 1.0;
                }
                sy += 1.0;
            }

            if covered != 0.0 {
                red /= covered;
                green /= covered;
                blue /= covered;
                alpha /= covered;
            }
            if alpha_sum != 0.0 {
                if contrib_sum != 0.0 {
                    alpha_sum /= contrib_sum;
                }
                red /= alpha_sum;
                green /= alpha_sum;
                blue /= alpha_sum;
            }

            *dst.get_pixel_mut(x as u32, y as u32) = Rgba([
                red.round().clamp(0.0, 255.0) as u8,
                green.round().clamp(0.0, 255.0) as u8,
                blue.round().clamp(0.0, 255.0) as u8,
                alpha.round().clamp(0.0, ALPHA_MAX as f32) as u8,
            ]);
        }
    }
    dst
}
