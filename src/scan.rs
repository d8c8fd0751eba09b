use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::VerdictCache;
use crate::config::Config;
use crate::corpus::{Corpus, CorpusMatch, DomainStatus};
use crate::error::{HashError, ScanError};
use crate::fingerprint::{self, FingerprintSet, HashKind};
use crate::render::Renderer;
use crate::site::CanonicalSite;

/// Outcome of classifying one canonical site.
#[derive(Debug)]
pub struct Verdict {
    pub phishing: bool,
    pub matched: Option<CorpusMatch>,
}

impl Verdict {
    fn clean() -> Self {
        Self {
            phishing: false,
            matched: None,
        }
    }

    /// The domain was already condemned; there is no fresh match to show.
    fn known_unsafe() -> Self {
        Self {
            phishing: true,
            matched: Some(CorpusMatch {
                matched_site: "(unknown)".to_string(),
                algorithm: "UNKNOWN",
                score: -1,
            }),
        }
    }
}

/// The detection pipeline: renders a page, derives its fingerprints, and
/// decides whether it impersonates a different domain in the corpus.
///
/// Every verdict is written back to the cache before returning, so a
/// connection never observes a half-updated classification.
pub struct Scanner {
    corpus: Corpus,
    cache: Arc<VerdictCache>,
    renderer: Arc<dyn Renderer>,
    fetcher: reqwest::Client,
    config: Arc<Config>,
}

impl Scanner {
    pub fn new(
        corpus: Corpus,
        cache: Arc<VerdictCache>,
        renderer: Arc<dyn Renderer>,
        config: Arc<Config>,
    ) -> Result<Self, reqwest::Error> {
        // The page is being classified, not trusted: fetch it even when the
        // upstream certificate would not verify.
        let fetcher = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.timeouts.fetch())
            .build()?;
        Ok(Self {
            corpus,
            cache,
            renderer,
            fetcher,
            config,
        })
    }

    /// Classifies a site, using `body` as the page HTML when the proxy has
    /// already buffered it (plain-HTTP path) and fetching it otherwise
    /// (CONNECT path).
    pub async fn classify(
        &self,
        scheme: &str,
        site: &CanonicalSite,
        body: Option<&[u8]>,
    ) -> Result<Verdict, ScanError> {
        let key = site.key();

        match self.corpus.domain_status(&site.domain).await? {
            DomainStatus::MarkedUnsafe => {
                // Condemned domains block without re-rendering; only
                // clearing the corpus lifts this.
                self.cache.set(&key, true);
                return Ok(Verdict::known_unsafe());
            }
            DomainStatus::MarkedSafe if self.corpus.site_exists(site).await? => {
                self.cache.set(&key, false);
                return Ok(Verdict::clean());
            }
            _ => {}
        }

        let html = match self.acquire_html(scheme, site, body).await {
            Ok(html) => html,
            Err(ScanError::NonHtmlContent) => {
                info!(site = %key, "non-HTML content, treating as clean");
                self.cache.set(&key, false);
                return Ok(Verdict::clean());
            }
            Err(e) => return Err(e),
        };

        if html.len() < self.config.min_html_bytes {
            info!(site = %key, bytes = html.len(), "HTML too small to fingerprint");
            self.cache.set(&key, false);
            return Ok(Verdict::clean());
        }

        let fingerprints = self.fingerprint_page(scheme, site, &html).await?;

        match self
            .corpus
            .find_match(&site.domain, &fingerprints, &self.config.thresholds)
            .await?
        {
            Some(hit) => {
                self.corpus.update_domain_status(&site.domain, false).await?;
                self.corpus
                    .insert_fingerprints(site, &fingerprints, false)
                    .await?;
                self.cache.set(&key, true);
                info!(
                    site = %key,
                    matched = %hit.matched_site,
                    algorithm = hit.algorithm,
                    score = hit.score,
                    "phishing detected"
                );
                Ok(Verdict {
                    phishing: true,
                    matched: Some(hit),
                })
            }
            None => {
                // Tentatively safe: safe-so-far, revisited per new path.
                self.corpus
                    .insert_fingerprints(site, &fingerprints, true)
                    .await?;
                self.cache.set(&key, false);
                Ok(Verdict::clean())
            }
        }
    }

    async fn acquire_html(
        &self,
        scheme: &str,
        site: &CanonicalSite,
        body: Option<&[u8]>,
    ) -> Result<Vec<u8>, ScanError> {
        let html = match body {
            Some(bytes) => bytes.to_vec(),
            None => {
                let response = self.fetcher.get(site.url(scheme)).send().await?;
                response.bytes().await?.to_vec()
            }
        };
        if !sniff_html(&html) {
            return Err(ScanError::NonHtmlContent);
        }
        Ok(html)
    }

    /// Renders the page and computes the full fingerprint set. Individual
    /// hash failures are tolerated; a failed render is not.
    async fn fingerprint_page(
        &self,
        scheme: &str,
        site: &CanonicalSite,
        html: &[u8],
    ) -> Result<FingerprintSet, ScanError> {
        let mut set = FingerprintSet::new();
        record(&mut set, HashKind::HtmlSsdeep, fingerprint::fuzzy_hash(html));

        let raw = self.renderer.render(&site.url(scheme)).await?;
        match fingerprint::decode_image(&raw) {
            Ok(img) => {
                let edges = fingerprint::edge_image(&img);
                record(
                    &mut set,
                    HashKind::ImageSsdeep,
                    fingerprint::fuzzy_hash(&fingerprint::quantized_pixels(&img)),
                );
                record(
                    &mut set,
                    HashKind::EdgesSsdeep,
                    fingerprint::fuzzy_hash(&fingerprint::quantized_pixels(&edges)),
                );
                set.insert(
                    HashKind::ImagePhash,
                    fingerprint::phash_to_hex(fingerprint::perceptual_hash(&img)),
                );
                set.insert(
                    HashKind::EdgesPhash,
                    fingerprint::phash_to_hex(fingerprint::perceptual_hash(&edges)),
                );

                match fingerprint::header_strip(
                    &img,
                    self.config.header_strip_px,
                    self.config.min_header_complexity,
                ) {
                    Ok(head) => {
                        record(
                            &mut set,
                            HashKind::HeaderSsdeep,
                            fingerprint::fuzzy_hash(&fingerprint::quantized_pixels(&head)),
                        );
                        set.insert(
                            HashKind::HeaderPhash,
                            fingerprint::phash_to_hex(fingerprint::perceptual_hash(&head)),
                        );
                    }
                    Err(e) => warn!(site = %site, error = %e, "header crop unusable"),
                }
            }
            Err(e) => warn!(site = %site, error = %e, "rendered image undecodable"),
        }
        Ok(set)
    }
}

fn record(set: &mut FingerprintSet, kind: HashKind, result: Result<String, HashError>) {
    match result {
        Ok(hash) => {
            set.insert(kind, hash);
        }
        Err(e) => warn!(kind = kind.label(), error = %e, "fingerprint failed"),
    }
}

/// Lightweight HTML content sniffing over the leading bytes, mirroring
/// WHATWG-style signature detection: non-HTML resources are not phishing
/// vectors and classify as clean.
fn sniff_html(body: &[u8]) -> bool {
    const SIGNATURES: [&str; 17] = [
        "<!DOCTYPE HTML",
        "<HTML",
        "<HEAD",
        "<SCRIPT",
        "<IFRAME",
        "<H1",
        "<DIV",
        "<FONT",
        "<TABLE",
        "<A",
        "<STYLE",
        "<TITLE",
        "<B",
        "<BODY",
        "<BR",
        "<P",
        "<!--",
    ];

    let trimmed: Vec<u8> = body
        .iter()
        .skip_while(|b| matches!(**b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .take(64)
        .copied()
        .collect();
    let head = String::from_utf8_lossy(&trimmed).to_uppercase();

    for sig in SIGNATURES {
        if let Some(rest) = head.strip_prefix(sig) {
            if matches!(rest.as_bytes().first(), Some(b' ') | Some(b'>')) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Renderer;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticRenderer {
        jpeg: Vec<u8>,
        calls: AtomicUsize,
    }

    impl StaticRenderer {
        fn new() -> Arc<Self> {
            let img = DynamicImage::ImageRgb8(RgbImage::from_fn(320, 240, |x, y| {
                if (x / 8 + y / 8) % 2 == 0 {
                    Rgb([250, 250, 250])
                } else {
                    Rgb([10, 10, 40])
                }
            }));
            let mut jpeg = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut jpeg),
                image::ImageOutputFormat::Jpeg(85),
            )
            .unwrap();
            Arc::new(Self {
                jpeg,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Renderer for StaticRenderer {
        async fn render(&self, _url: &str) -> Result<Vec<u8>, crate::error::RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.jpeg.clone())
        }
    }

    struct FailingRenderer;

    #[async_trait]
    impl Renderer for FailingRenderer {
        async fn render(&self, _url: &str) -> Result<Vec<u8>, crate::error::RenderError> {
            Err(crate::error::RenderError::Failed("boom".to_string()))
        }
    }

    fn site(subdomain: &str, domain: &str, path: &str) -> CanonicalSite {
        CanonicalSite {
            subdomain: subdomain.to_string(),
            domain: domain.to_string(),
            path: path.to_string(),
        }
    }

    fn big_html(marker: &str) -> Vec<u8> {
        let mut page = format!("<html><head><title>{marker}</title></head><body>");
        while page.len() < 8192 {
            page.push_str(marker);
            page.push_str(" lorem ipsum dolor sit amet consectetur ");
        }
        page.push_str("</body></html>");
        page.into_bytes()
    }

    async fn scanner_with(
        renderer: Arc<dyn Renderer>,
    ) -> (Scanner, Corpus, Arc<VerdictCache>) {
        let corpus = Corpus::open_in_memory().await.unwrap();
        let cache = Arc::new(VerdictCache::new());
        let scanner = Scanner::new(
            corpus.clone(),
            Arc::clone(&cache),
            renderer,
            Arc::new(Config::default()),
        )
        .unwrap();
        (scanner, corpus, cache)
    }

    #[test]
    fn sniffing_accepts_html_and_rejects_other_content() {
        assert!(sniff_html(b"  <!DOCTYPE html><html></html>"));
        assert!(sniff_html(b"<html lang=\"en\"><body></body></html>"));
        assert!(sniff_html(b"\r\n<DIV >"));
        assert!(!sniff_html(b"{\"json\": true}"));
        assert!(!sniff_html(b"\x89PNG\r\n"));
        assert!(!sniff_html(b"plain text mentioning <html later"));
    }

    #[tokio::test]
    async fn too_small_body_is_clean_without_hashing() {
        let renderer = StaticRenderer::new();
        let (scanner, corpus, cache) = scanner_with(renderer.clone()).await;

        let s = site("", "small.net", "login");
        let body = b"<html><body>tiny</body></html>".to_vec();
        let verdict = scanner
            .classify("http://", &s, Some(&body))
            .await
            .unwrap();

        assert!(!verdict.phishing);
        assert_eq!(cache.get("small.net/login"), Some(false));
        assert_eq!(renderer.calls(), 0);
        assert_eq!(
            corpus.domain_status("small.net").await.unwrap(),
            DomainStatus::Unseen
        );
    }

    #[tokio::test]
    async fn non_html_body_is_clean_and_cached() {
        let renderer = StaticRenderer::new();
        let (scanner, _corpus, cache) = scanner_with(renderer.clone()).await;

        let mut body = br#"{"data": ""#.to_vec();
        body.extend(std::iter::repeat(b'x').take(8192));
        body.extend_from_slice(b"\"}");

        let s = site("api", "example.com", "v1");
        let verdict = scanner.classify("http://", &s, Some(&body)).await.unwrap();
        assert!(!verdict.phishing);
        assert_eq!(cache.get("api.example.com/v1"), Some(false));
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn condemned_domain_blocks_without_rendering() {
        let renderer = StaticRenderer::new();
        let (scanner, corpus, cache) = scanner_with(renderer.clone()).await;

        let mut hashes = FingerprintSet::new();
        hashes.insert(HashKind::HtmlSsdeep, "3:abc:def".to_string());
        corpus
            .insert_fingerprints(&site("", "evil.com", "login"), &hashes, false)
            .await
            .unwrap();

        let verdict = scanner
            .classify("https://", &site("", "evil.com", "fresh-path"), None)
            .await
            .unwrap();

        assert!(verdict.phishing);
        let hit = verdict.matched.unwrap();
        assert_eq!(hit.matched_site, "(unknown)");
        assert_eq!(hit.score, -1);
        assert_eq!(renderer.calls(), 0);
        assert_eq!(cache.get("evil.com/fresh-path"), Some(true));
    }

    #[tokio::test]
    async fn vetted_exact_page_skips_rescan() {
        let renderer = StaticRenderer::new();
        let (scanner, corpus, cache) = scanner_with(renderer.clone()).await;

        let s = site("", "good.com", "login");
        let mut hashes = FingerprintSet::new();
        hashes.insert(
            HashKind::HtmlSsdeep,
            fingerprint::fuzzy_hash(&big_html("good")).unwrap(),
        );
        corpus.insert_fingerprints(&s, &hashes, true).await.unwrap();

        let verdict = scanner.classify("https://", &s, None).await.unwrap();
        assert!(!verdict.phishing);
        assert_eq!(renderer.calls(), 0);
        assert_eq!(cache.get("good.com/login"), Some(false));
    }

    #[tokio::test]
    async fn clone_of_stored_site_is_detected_and_condemned() {
        let renderer = StaticRenderer::new();
        let (scanner, corpus, cache) = scanner_with(renderer.clone()).await;

        let bank_page = big_html("example bank sign in");
        let mut hashes = FingerprintSet::new();
        hashes.insert(
            HashKind::HtmlSsdeep,
            fingerprint::fuzzy_hash(&bank_page).unwrap(),
        );
        corpus
            .insert_fingerprints(&site("", "a.com", "login"), &hashes, true)
            .await
            .unwrap();

        let verdict = scanner
            .classify("https://", &site("", "b.net", "login"), Some(&bank_page))
            .await
            .unwrap();

        assert!(verdict.phishing);
        let hit = verdict.matched.unwrap();
        assert!(hit.matched_site.contains("a.com"));
        assert_eq!(hit.algorithm, "HTML");
        assert!(hit.score >= 30);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(cache.get("b.net/login"), Some(true));
        assert_eq!(
            corpus.domain_status("b.net").await.unwrap(),
            DomainStatus::MarkedUnsafe
        );
    }

    #[tokio::test]
    async fn unmatched_page_is_recorded_tentatively_safe() {
        let renderer = StaticRenderer::new();
        let (scanner, corpus, cache) = scanner_with(renderer.clone()).await;

        let s = site("", "fresh.org", "");
        let verdict = scanner
            .classify("https://", &s, Some(&big_html("unique content")))
            .await
            .unwrap();

        assert!(!verdict.phishing);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(cache.get("fresh.org/"), Some(false));
        assert_eq!(
            corpus.domain_status("fresh.org").await.unwrap(),
            DomainStatus::MarkedSafe
        );
        assert!(corpus.site_exists(&s).await.unwrap());
    }

    #[tokio::test]
    async fn render_failure_aborts_without_verdict() {
        let (scanner, corpus, cache) = scanner_with(Arc::new(FailingRenderer)).await;

        let s = site("", "flaky.io", "");
        let err = scanner
            .classify("https://", &s, Some(&big_html("whatever")))
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::Render(_)));
        // Infrastructure failure: neither cache nor corpus records anything.
        assert_eq!(cache.get("flaky.io/"), None);
        assert_eq!(
            corpus.domain_status("flaky.io").await.unwrap(),
            DomainStatus::Unseen
        );
    }
}
