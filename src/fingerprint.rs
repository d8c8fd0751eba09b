use std::collections::HashMap;

use fuzzyhash::FuzzyHash;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::HashError;

/// Laplacian kernel used to normalize away color-palette tricks before
/// fingerprinting.
const EDGE_KERNEL: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];

/// Luma value above which an edge pixel counts as high-contrast.
const EDGE_LUMA_CUTOFF: u8 = 128;

const PHASH_INPUT: u32 = 32;
const PHASH_BLOCK: usize = 8;

/// Closed enumeration of every fingerprint stored in the corpus. The wire
/// code is the persisted `hashtype` column and must stay stable.
///
/// Two families with different score distributions: fuzzy content hashes
/// (ssdeep, scored 0..=100) and perceptual image hashes (scored as agreeing
/// bits out of 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    HtmlSsdeep,
    ImageSsdeep,
    EdgesSsdeep,
    HeaderSsdeep,
    ImagePhash,
    EdgesPhash,
    HeaderPhash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFamily {
    Fuzzy,
    Perceptual,
}

impl HashKind {
    pub const ALL: [HashKind; 7] = [
        HashKind::HtmlSsdeep,
        HashKind::ImageSsdeep,
        HashKind::EdgesSsdeep,
        HashKind::HeaderSsdeep,
        HashKind::ImagePhash,
        HashKind::EdgesPhash,
        HashKind::HeaderPhash,
    ];

    pub fn code(self) -> i64 {
        match self {
            HashKind::HtmlSsdeep => 0,
            HashKind::ImageSsdeep => 1,
            HashKind::EdgesSsdeep => 2,
            HashKind::HeaderSsdeep => 3,
            HashKind::ImagePhash => 4,
            HashKind::EdgesPhash => 5,
            HashKind::HeaderPhash => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// Display name used in logs and on the warning page.
    pub fn label(self) -> &'static str {
        match self {
            HashKind::HtmlSsdeep => "HTML",
            HashKind::ImageSsdeep => "IMAGE",
            HashKind::EdgesSsdeep => "EDGES",
            HashKind::HeaderSsdeep => "HEADER",
            HashKind::ImagePhash => "IMAGE_PHASH",
            HashKind::EdgesPhash => "EDGES_PHASH",
            HashKind::HeaderPhash => "HEADER_PHASH",
        }
    }

    pub fn family(self) -> HashFamily {
        match self {
            HashKind::HtmlSsdeep
            | HashKind::ImageSsdeep
            | HashKind::EdgesSsdeep
            | HashKind::HeaderSsdeep => HashFamily::Fuzzy,
            HashKind::ImagePhash | HashKind::EdgesPhash | HashKind::HeaderPhash => {
                HashFamily::Perceptual
            }
        }
    }

    /// Similarity score between a stored hash and a probe hash of this kind.
    /// `None` when either side is empty or unparseable.
    pub fn score(self, stored: &str, probe: &str) -> Option<i64> {
        match self.family() {
            HashFamily::Fuzzy => fuzzy_score(stored, probe),
            HashFamily::Perceptual => phash_score(stored, probe),
        }
    }
}

/// The set of hashes computed for one page. Kinds that failed to compute
/// are absent; the corpus records those as empty strings.
pub type FingerprintSet = HashMap<HashKind, String>;

pub fn fuzzy_hash(data: &[u8]) -> Result<String, HashError> {
    if data.is_empty() {
        return Err(HashError::EmptyInput);
    }
    Ok(FuzzyHash::new(data).to_string())
}

pub fn fuzzy_score(a: &str, b: &str) -> Option<i64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    FuzzyHash::compare(a, b).ok().map(|s| s as i64)
}

pub fn decode_image(raw: &[u8]) -> Result<DynamicImage, HashError> {
    if raw.is_empty() {
        return Err(HashError::EmptyInput);
    }
    Ok(image::load_from_memory(raw)?)
}

/// Edge-detection transform: grayscale then Laplacian convolution.
pub fn edge_image(img: &DynamicImage) -> DynamicImage {
    img.grayscale().filter3x3(&EDGE_KERNEL)
}

/// Fraction of high-contrast pixels in the edge transform of `img`.
pub fn edge_complexity(img: &DynamicImage) -> f64 {
    let edges = edge_image(img).to_luma8();
    let (w, h) = edges.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let hot = edges.pixels().filter(|p| p[0] > EDGE_LUMA_CUTOFF).count();
    hot as f64 / (w as f64 * h as f64)
}

/// Crops the page-header strip (where brand logos concentrate) and rejects
/// crops whose edge complexity is too low to fingerprint meaningfully.
pub fn header_strip(
    img: &DynamicImage,
    strip_px: u32,
    min_complexity: f64,
) -> Result<DynamicImage, HashError> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(HashError::EmptyInput);
    }
    let crop = img.crop_imm(0, 0, w, strip_px.min(h));

    let complexity = edge_complexity(&crop);
    if complexity < min_complexity {
        return Err(HashError::LowComplexity(complexity));
    }
    Ok(crop)
}

/// Flattens an image to quantized RGB bytes for fuzzy hashing. Channels are
/// rounded down to multiples of 10 so near-identical renders hash alike;
/// zero becomes 1 so the byte stream never embeds NULs.
pub fn quantized_pixels(img: &DynamicImage) -> Vec<u8> {
    let rgb = img.to_rgb8();
    let mut pixels = Vec::with_capacity(rgb.len());
    for p in rgb.pixels() {
        for c in p.0 {
            let q = c - c % 10;
            pixels.push(if q == 0 { 1 } else { q });
        }
    }
    pixels
}

/// 64-bit DCT perceptual hash: downscale to 32x32 luma, 2D DCT, threshold
/// the low-frequency 8x8 block against its median.
pub fn perceptual_hash(img: &DynamicImage) -> u64 {
    let small = img
        .resize_exact(PHASH_INPUT, PHASH_INPUT, FilterType::Triangle)
        .to_luma8();

    let n = PHASH_INPUT as usize;
    let mut vals = vec![0f64; n * n];
    for (x, y, p) in small.enumerate_pixels() {
        vals[y as usize * n + x as usize] = p[0] as f64;
    }
    let freq = dct_2d(&vals, n);

    let mut block = [0f64; PHASH_BLOCK * PHASH_BLOCK];
    for v in 0..PHASH_BLOCK {
        for u in 0..PHASH_BLOCK {
            block[v * PHASH_BLOCK + u] = freq[v * n + u];
        }
    }

    let mut sorted = block;
    sorted.sort_by(f64::total_cmp);
    let median = (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0;

    let mut bits = 0u64;
    for (i, coeff) in block.iter().enumerate() {
        if *coeff > median {
            bits |= 1 << i;
        }
    }
    bits
}

pub fn phash_to_hex(hash: u64) -> String {
    format!("{hash:016x}")
}

/// Perceptual similarity: agreeing bits out of 64. Random pairs score
/// around 32; identical images score 64.
pub fn phash_score(a: &str, b: &str) -> Option<i64> {
    let a = u64::from_str_radix(a, 16).ok()?;
    let b = u64::from_str_radix(b, 16).ok()?;
    Some(64 - (a ^ b).count_ones() as i64)
}

fn dct_2d(input: &[f64], n: usize) -> Vec<f64> {
    let mut rows = vec![0f64; n * n];
    for y in 0..n {
        dct_1d(&input[y * n..(y + 1) * n], &mut rows[y * n..(y + 1) * n]);
    }
    let mut out = vec![0f64; n * n];
    let mut column = vec![0f64; n];
    let mut transformed = vec![0f64; n];
    for x in 0..n {
        for y in 0..n {
            column[y] = rows[y * n + x];
        }
        dct_1d(&column, &mut transformed);
        for y in 0..n {
            out[y * n + x] = transformed[y];
        }
    }
    out
}

fn dct_1d(input: &[f64], out: &mut [f64]) {
    let n = input.len();
    for (k, slot) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (i, v) in input.iter().enumerate() {
            sum += v * (std::f64::consts::PI / n as f64 * (i as f64 + 0.5) * k as f64).cos();
        }
        *slot = sum;
    }
}
