//! Upload screening
//!
//! Filename rules, an extension and MIME allow-list, size ceilings, magic
//! byte checks, embedded-script detection and a virus scan. The scan is
//! best effort: an absent or failing scanner yields a skipped, flagged
//! result instead of a rejection.

use crate::audit::{AuditEntry, AuditLedger, RequestContext};
use crate::config::UploadConfig;
use crate::crypto;
use crate::error::{Error, Result};
use regex::RegexSet;
use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_FILENAME_LEN: usize = 255;
const DANGEROUS_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\'];
const CLAMD_CHUNK: usize = 64 * 1024;

const OLE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP: &[u8] = b"PK\x03\x04";
const RAR: &[u8] = b"Rar!\x1A\x07";

/// Executable formats never accepted, whatever the declared type
const EXECUTABLE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"MZ", "executable"),
    (b"\x7FELF", "elf"),
    (&[0xCA, 0xFE, 0xBA, 0xBE], "java_class"),
];

const SCRIPT_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)<script", "JavaScript code"),
    (r"(?i)<iframe", "Iframe element"),
    (r"(?i)javascript:", "JavaScript protocol"),
    (r"(?i)vbscript:", "VBScript code"),
    (r"(?i)\bon[a-z]+\s*=", "Event handler"),
    (r"(?i)\beval\s*\(", "Eval function"),
    (r"(?i)\bexec\s*\(", "Exec function"),
    (r"(?i)<\?php", "PHP code"),
    (r"<%", "Server-side script"),
    (r"\$_[A-Z]+", "PHP superglobal"),
];

const SUSPICIOUS_METADATA: &[&str] = &["metasploit", "exploit", "hack", "payload"];

/// Broad file family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    /// Raster images
    Image,
    /// Office documents, PDF and plain text
    Document,
    /// Compressed archives
    Archive,
}

struct AllowedType {
    extension: &'static str,
    category: FileCategory,
    mime_types: &'static [&'static str],
}

const ALLOWED_TYPES: &[AllowedType] = &[
    AllowedType { extension: "jpg", category: FileCategory::Image, mime_types: &["image/jpeg", "image/pjpeg"] },
    AllowedType { extension: "jpeg", category: FileCategory::Image, mime_types: &["image/jpeg", "image/pjpeg"] },
    AllowedType { extension: "png", category: FileCategory::Image, mime_types: &["image/png"] },
    AllowedType { extension: "gif", category: FileCategory::Image, mime_types: &["image/gif"] },
    AllowedType { extension: "webp", category: FileCategory::Image, mime_types: &["image/webp"] },
    AllowedType { extension: "pdf", category: FileCategory::Document, mime_types: &["application/pdf"] },
    AllowedType { extension: "doc", category: FileCategory::Document, mime_types: &["application/msword"] },
    AllowedType {
        extension: "docx",
        category: FileCategory::Document,
        mime_types: &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
    },
    AllowedType { extension: "xls", category: FileCategory::Document, mime_types: &["application/vnd.ms-excel"] },
    AllowedType {
        extension: "xlsx",
        category: FileCategory::Document,
        mime_types: &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"],
    },
    AllowedType { extension: "txt", category: FileCategory::Document, mime_types: &["text/plain"] },
    AllowedType { extension: "csv", category: FileCategory::Document, mime_types: &["text/csv", "application/csv"] },
    AllowedType {
        extension: "zip",
        category: FileCategory::Archive,
        mime_types: &["application/zip", "application/x-zip-compressed"],
    },
    AllowedType { extension: "rar", category: FileCategory::Archive, mime_types: &["application/x-rar-compressed"] },
];

/// Whether `content` starts the way a file of type `extension` must
fn content_matches(extension: &str, content: &[u8]) -> bool {
    match extension {
        "jpg" | "jpeg" => content.starts_with(&[0xFF, 0xD8, 0xFF]),
        "png" => content.starts_with(b"\x89PNG\r\n\x1A\n"),
        "gif" => content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a"),
        "webp" => content.starts_with(b"RIFF") && content.get(8..12) == Some(&b"WEBP"[..]),
        "pdf" => content.starts_with(b"%PDF-"),
        "doc" | "xls" => content.starts_with(OLE),
        "docx" | "xlsx" | "zip" => content.starts_with(ZIP),
        "rar" => content.starts_with(RAR),
        // plain text carries no signature but never holds NUL bytes
        _ => !content.contains(&0),
    }
}

/// Result of one virus scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanVerdict {
    /// Nothing found
    Clean,
    /// Signature name reported by the scanner
    Infected(String),
}

/// Virus scanner seam
pub trait VirusScanner: Send + Sync {
    /// Scan a buffer. `Unavailable` when the scanner cannot be reached.
    fn scan(&self, content: &[u8]) -> Result<ScanVerdict>;
}

/// clamd over TCP using the `INSTREAM` command
#[derive(Debug, Clone)]
pub struct ClamdScanner {
    addr: String,
    timeout: Duration,
}

impl ClamdScanner {
    /// Scanner for `host:port`
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    fn parse_reply(reply: &[u8]) -> Result<ScanVerdict> {
        let text = String::from_utf8_lossy(reply);
        let text = text.trim_end_matches('\0').trim();
        if let Some(result) = text.strip_prefix("stream:").map(str::trim) {
            if result == "OK" {
                return Ok(ScanVerdict::Clean);
            }
            if let Some(signature) = result.strip_suffix("FOUND") {
                return Ok(ScanVerdict::Infected(signature.trim().to_string()));
            }
        }
        Err(Error::Unavailable(format!("Unexpected clamd reply: {}", text)))
    }
}

impl VirusScanner for ClamdScanner {
    fn scan(&self, content: &[u8]) -> Result<ScanVerdict> {
        let unavailable = |e: std::io::Error| Error::Unavailable(format!("clamd at {}: {}", self.addr, e));

        let addr = self
            .addr
            .to_socket_addrs()
            .map_err(unavailable)?
            .next()
            .ok_or_else(|| Error::Unavailable(format!("clamd address did not resolve: {}", self.addr)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(unavailable)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(unavailable)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(unavailable)?;

        stream.write_all(b"zINSTREAM\0").map_err(unavailable)?;
        for chunk in content.chunks(CLAMD_CHUNK) {
            stream
                .write_all(&(chunk.len() as u32).to_be_bytes())
                .map_err(unavailable)?;
            stream.write_all(chunk).map_err(unavailable)?;
        }
        stream.write_all(&0u32.to_be_bytes()).map_err(unavailable)?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).map_err(unavailable)?;
        Self::parse_reply(&reply)
    }
}

/// A file as received from the client
#[derive(Clone, Copy)]
pub struct Upload<'a> {
    /// Client-supplied name
    pub filename: &'a str,
    /// Client-declared MIME type
    pub mime_type: &'a str,
    /// Raw bytes
    pub content: &'a [u8],
}

impl fmt::Debug for Upload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("size", &self.content.len())
            .finish()
    }
}

/// Descriptive facts about an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Client-supplied name
    pub original_name: String,
    /// Bytes
    pub size: u64,
    /// Client-declared MIME type
    pub mime_type: String,
    /// Lowercased extension
    pub extension: String,
    /// Content digest
    pub sha256: String,
}

/// Virus scan as reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ScanOutcome {
    /// Scanned, nothing found
    Clean,
    /// Scanned, signature found
    Infected {
        /// Scanner signature name
        signature: String,
    },
    /// Not scanned
    Skipped {
        /// Why the scan did not run
        reason: String,
    },
}

/// Security checks performed on the content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityScan {
    /// No threats found
    pub safe: bool,
    /// Threat descriptions
    pub threats: Vec<String>,
    /// Checks that ran, in order
    pub scans_performed: Vec<String>,
    /// Virus scan result
    pub virus_scan: ScanOutcome,
}

/// Outcome of [`UploadValidator::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Accepted
    pub valid: bool,
    /// Rejection reasons
    pub errors: Vec<String>,
    /// Facts about the file
    pub file_info: FileInfo,
    /// Content checks, when reached
    pub security_scan: Option<SecurityScan>,
    /// Accepted without a virus scan; hold for review
    pub flagged: bool,
}

/// Upload validator
pub struct UploadValidator {
    config: UploadConfig,
    scanner: Option<Arc<dyn VirusScanner>>,
    scripts: RegexSet,
    audit: Option<Arc<AuditLedger>>,
}

impl UploadValidator {
    /// Create from configuration. A configured clamd address installs a
    /// [`ClamdScanner`].
    pub fn new(config: UploadConfig) -> Result<Self> {
        let scripts = RegexSet::new(SCRIPT_PATTERNS.iter().map(|(pattern, _)| *pattern))
            .map_err(|e| Error::Config(format!("Script patterns: {}", e)))?;
        let scanner = config.clamd_addr.as_ref().map(|addr| {
            Arc::new(ClamdScanner::new(
                addr.clone(),
                Duration::from_secs(config.scanner_timeout_secs),
            )) as Arc<dyn VirusScanner>
        });
        Ok(Self {
            config,
            scanner,
            scripts,
            audit: None,
        })
    }

    /// Replace the virus scanner
    pub fn with_scanner(mut self, scanner: Arc<dyn VirusScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Record blocked uploads in an audit ledger
    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Size ceiling for the given categories: the largest that applies
    pub fn max_size(&self, categories: &[FileCategory]) -> u64 {
        categories
            .iter()
            .map(|category| match category {
                FileCategory::Image => self.config.max_image_bytes,
                FileCategory::Document => self.config.max_document_bytes,
                FileCategory::Archive => self.config.max_archive_bytes,
            })
            .fold(self.config.max_default_bytes, u64::max)
    }

    /// Run every check. Rejections are audited as `file_upload_blocked`.
    pub fn validate(
        &self,
        upload: &Upload<'_>,
        categories: &[FileCategory],
        context: &RequestContext,
    ) -> UploadReport {
        let mut report = UploadReport {
            valid: false,
            errors: Vec::new(),
            file_info: FileInfo {
                original_name: upload.filename.to_string(),
                size: upload.content.len() as u64,
                mime_type: upload.mime_type.to_string(),
                extension: extension(upload.filename),
                sha256: crypto::sha256_hex(upload.content),
            },
            security_scan: None,
            flagged: false,
        };

        match self.run_checks(upload, categories, &mut report) {
            Ok(()) => {
                report.valid = true;
                info!(
                    filename = %upload.filename,
                    size = upload.content.len(),
                    flagged = report.flagged,
                    "Upload accepted"
                );
            }
            Err(e) => {
                let reason = match e {
                    Error::Validation(reason) => reason,
                    other => other.to_string(),
                };
                warn!(filename = %upload.filename, reason = %reason, "Upload blocked");
                if let Some(audit) = &self.audit {
                    audit.log(
                        AuditEntry::new("file_upload_blocked", "File upload security event: file_upload_blocked")
                            .with_resource("file_upload", upload.filename)
                            .with_context(context)
                            .with_tag("file_upload")
                            .with_metadata(serde_json::json!({
                                "filename": upload.filename,
                                "size": upload.content.len(),
                                "mime_type": upload.mime_type,
                                "error": reason,
                            })),
                    );
                }
                report.errors.push(reason);
            }
        }
        report
    }

    fn run_checks(&self, upload: &Upload<'_>, categories: &[FileCategory], report: &mut UploadReport) -> Result<()> {
        check_filename(upload.filename)?;

        let extension = report.file_info.extension.clone();
        let extension = extension.as_str();
        let allowed = ALLOWED_TYPES.iter().any(|t| {
            t.extension == extension && categories.contains(&t.category) && t.mime_types.contains(&upload.mime_type)
        });
        if !allowed {
            return Err(Error::Validation(format!(
                "File type not allowed: {} ({})",
                extension, upload.mime_type
            )));
        }

        let max = self.max_size(categories);
        if report.file_info.size > max {
            return Err(Error::Validation(format!(
                "File size exceeds maximum allowed size of {:.2}MB",
                max as f64 / 1_048_576.0
            )));
        }

        let scan = self.security_scan(upload);
        report.flagged = matches!(scan.virus_scan, ScanOutcome::Skipped { .. });
        let safe = scan.safe;
        let threats = scan.threats.join(", ");
        report.security_scan = Some(scan);
        if !safe {
            return Err(Error::Validation(format!("File failed security scan: {}", threats)));
        }

        if !content_matches(extension, upload.content) {
            return Err(Error::Validation(format!(
                "File content does not match its type: {}",
                extension
            )));
        }
        Ok(())
    }

    fn security_scan(&self, upload: &Upload<'_>) -> SecurityScan {
        let mut threats = Vec::new();
        let head = &upload.content[..upload.content.len().min(self.config.content_scan_bytes)];

        for (signature, kind) in EXECUTABLE_SIGNATURES {
            if head.starts_with(signature) {
                threats.push(format!("Dangerous file signature detected: {}", kind));
            }
        }

        let text = String::from_utf8_lossy(head);
        for index in self.scripts.matches(&text).into_iter() {
            threats.push(format!("Embedded script detected: {}", SCRIPT_PATTERNS[index].1));
        }

        let virus_scan = self.virus_scan(upload);
        if let ScanOutcome::Infected { signature } = &virus_scan {
            threats.push(format!("Virus detected: {}", signature));
        }

        if upload.mime_type.starts_with("image/") {
            let lowered = text.to_lowercase();
            for word in SUSPICIOUS_METADATA {
                if lowered.contains(word) {
                    threats.push(format!("Suspicious software in metadata: {}", word));
                }
            }
        }

        SecurityScan {
            safe: threats.is_empty(),
            threats,
            scans_performed: ["signature_check", "script_detection", "virus_scan", "metadata_check"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            virus_scan,
        }
    }

    fn virus_scan(&self, upload: &Upload<'_>) -> ScanOutcome {
        let Some(scanner) = &self.scanner else {
            warn!(filename = %upload.filename, "Virus scanner not configured, upload flagged");
            return ScanOutcome::Skipped {
                reason: "Virus scanner not available".into(),
            };
        };
        match scanner.scan(upload.content) {
            Ok(ScanVerdict::Clean) => ScanOutcome::Clean,
            Ok(ScanVerdict::Infected(signature)) => ScanOutcome::Infected { signature },
            Err(e) => {
                warn!(filename = %upload.filename, error = %e, "Virus scan skipped, upload flagged");
                ScanOutcome::Skipped {
                    reason: format!("Virus scanner error: {}", e),
                }
            }
        }
    }
}

impl fmt::Debug for UploadValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadValidator")
            .field("config", &self.config)
            .field("scanner", &self.scanner.is_some())
            .finish_non_exhaustive()
    }
}

fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

fn check_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(Error::Validation("Invalid file upload".into()));
    }
    if filename.contains(DANGEROUS_FILENAME_CHARS) || filename.chars().any(char::is_control) {
        return Err(Error::Validation("Filename contains dangerous characters".into()));
    }
    if filename.starts_with('.') || filename.starts_with("__") {
        return Err(Error::Validation("Hidden or system files are not allowed".into()));
    }
    if filename.matches('.').count() > 1 {
        return Err(Error::Validation("Files with multiple extensions are not allowed".into()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(Error::Validation("Filename too long".into()));
    }
    Ok(())
}

/// Rewrite a client filename so it passes the filename rules.
///
/// Drops dangerous and control characters and leading dots or
/// underscores, turns spaces into `_`, folds inner dots into `_` keeping
/// the last extension, and trims the stem to fit 255 bytes.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !DANGEROUS_FILENAME_CHARS.contains(c) && !c.is_control())
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']);

    let (stem, ext) = match cleaned.rsplit_once('.') {
        Some((stem, ext)) => (stem.replace('.', "_"), Some(ext)),
        None => (cleaned.to_string(), None),
    };

    let ext_len = ext.map_or(0, |e| e.len() + 1);
    let mut stem = stem;
    if stem.len() + ext_len > MAX_FILENAME_LEN {
        let mut cut = MAX_FILENAME_LEN.saturating_sub(ext_len).min(stem.len());
        while !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        stem.truncate(cut);
    }

    match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SearchCriteria;
    use crate::clock::ManualClock;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PNG: &[u8] = b"\x89PNG\r\n\x1A\n\0\0\0\rIHDR\0\0\0\x10\0\0\0\x10\x08\x06\0\0\0";
    const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n";

    struct StaticScanner {
        verdict: Option<ScanVerdict>,
        calls: AtomicUsize,
    }

    impl VirusScanner for StaticScanner {
        fn scan(&self, _content: &[u8]) -> Result<ScanVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
                .clone()
                .ok_or_else(|| Error::Unavailable("scanner offline".into()))
        }
    }

    fn scanner(verdict: Option<ScanVerdict>) -> Arc<StaticScanner> {
        Arc::new(StaticScanner {
            verdict,
            calls: AtomicUsize::new(0),
        })
    }

    fn validator() -> UploadValidator {
        UploadValidator::new(UploadConfig::default()).unwrap()
    }

    fn upload<'a>(filename: &'a str, mime_type: &'a str, content: &'a [u8]) -> Upload<'a> {
        Upload {
            filename,
            mime_type,
            content,
        }
    }

    const IMAGES: &[FileCategory] = &[FileCategory::Image, FileCategory::Document];

    #[test]
    fn test_clean_upload_with_scanner() {
        let scanner = scanner(Some(ScanVerdict::Clean));
        let validator = validator().with_scanner(scanner.clone());
        let report = validator.validate(&upload("photo.png", "image/png", PNG), IMAGES, &RequestContext::default());

        assert!(report.valid, "{:?}", report.errors);
        assert!(!report.flagged);
        assert_eq!(report.file_info.extension, "png");
        assert_eq!(report.file_info.sha256, crypto::sha256_hex(PNG));
        let scan = report.security_scan.unwrap();
        assert_eq!(scan.virus_scan, ScanOutcome::Clean);
        assert_eq!(scan.scans_performed.len(), 4);
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_scanner_is_skipped_and_flagged() {
        let report = validator().validate(&upload("report.pdf", "application/pdf", PDF), IMAGES, &RequestContext::default());
        assert!(report.valid);
        assert!(report.flagged);
        assert_eq!(
            report.security_scan.unwrap().virus_scan,
            ScanOutcome::Skipped {
                reason: "Virus scanner not available".into()
            }
        );
    }

    #[test]
    fn test_scanner_error_is_skipped_and_flagged() {
        let validator = validator().with_scanner(scanner(None));
        let report = validator.validate(&upload("photo.png", "image/png", PNG), IMAGES, &RequestContext::default());
        assert!(report.valid);
        assert!(report.flagged);
        assert!(matches!(
            report.security_scan.unwrap().virus_scan,
            ScanOutcome::Skipped { reason } if reason.contains("scanner offline")
        ));
    }

    #[test]
    fn test_infected_upload_blocked_and_audited() {
        let audit = Arc::new(AuditLedger::in_memory(ManualClock::starting_now()));
        let validator = validator()
            .with_scanner(scanner(Some(ScanVerdict::Infected("Eicar-Test-Signature".into()))))
            .with_audit(audit.clone());
        let report = validator.validate(&upload("photo.png", "image/png", PNG), IMAGES, &RequestContext::default());

        assert!(!report.valid);
        assert!(!report.flagged);
        assert!(report.errors[0].contains("Virus detected: Eicar-Test-Signature"));
        let blocked = audit
            .search(&SearchCriteria::new().event_type("file_upload_blocked"))
            .unwrap();
        assert_eq!(blocked.total, 1);
        assert!(blocked.items[0].tags.contains("file_upload"));
    }

    #[test]
    fn test_filename_rules() {
        let v = validator();
        let ctx = RequestContext::default();
        let reject = |name: &str| v.validate(&upload(name, "image/png", PNG), IMAGES, &ctx).errors;

        assert_eq!(reject("../photo.png"), ["Filename contains dangerous characters"]);
        assert_eq!(reject("ph<o>to.png"), ["Filename contains dangerous characters"]);
        assert_eq!(reject(".htaccess"), ["Hidden or system files are not allowed"]);
        assert_eq!(reject("__init.png"), ["Hidden or system files are not allowed"]);
        assert_eq!(reject("photo.php.png"), ["Files with multiple extensions are not allowed"]);
        assert_eq!(reject(&format!("{}.png", "a".repeat(300))), ["Filename too long"]);
    }

    #[test]
    fn test_type_and_size_rules() {
        let v = validator();
        let ctx = RequestContext::default();

        let report = v.validate(&upload("photo.png", "image/jpeg", PNG), IMAGES, &ctx);
        assert_eq!(report.errors, ["File type not allowed: png (image/jpeg)"]);

        let report = v.validate(&upload("bundle.zip", "application/zip", ZIP), IMAGES, &ctx);
        assert_eq!(report.errors, ["File type not allowed: zip (application/zip)"]);

        let big = vec![b'a'; 10 * 1024 * 1024 + 1];
        let report = v.validate(&upload("notes.txt", "text/plain", &big), IMAGES, &ctx);
        assert_eq!(report.errors, ["File size exceeds maximum allowed size of 10.00MB"]);
        assert!(report.security_scan.is_none());
        assert_eq!(v.max_size(&[]), 2 * 1024 * 1024);
        assert_eq!(v.max_size(&[FileCategory::Archive, FileCategory::Image]), 50 * 1024 * 1024);
    }

    #[test]
    fn test_signature_and_script_detection() {
        let v = validator();
        let ctx = RequestContext::default();

        let mut exe = b"MZ\x90\0".to_vec();
        exe.extend_from_slice(&PNG[4..]);
        let report = v.validate(&upload("photo.png", "image/png", &exe), IMAGES, &ctx);
        assert!(report.errors[0].contains("Dangerous file signature detected: executable"));

        let mut polyglot = PNG.to_vec();
        polyglot.extend_from_slice(b"<?php system($_GET['c']); ?>");
        let report = v.validate(&upload("photo.png", "image/png", &polyglot), IMAGES, &ctx);
        let threats = report.security_scan.unwrap().threats;
        assert!(threats.contains(&"Embedded script detected: PHP code".to_string()));
        assert!(threats.contains(&"Embedded script detected: PHP superglobal".to_string()));

        let report = v.validate(&upload("notes.txt", "text/plain", b"<script>alert(1)</script>"), IMAGES, &ctx);
        assert!(!report.valid);

        let report = v.validate(&upload("notes.txt", "text/plain", b"condition = ok\nsection = 2\n"), IMAGES, &ctx);
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_content_must_match_type() {
        let v = validator();
        let ctx = RequestContext::default();
        let report = v.validate(&upload("photo.jpg", "image/jpeg", PNG), IMAGES, &ctx);
        assert_eq!(report.errors, ["File content does not match its type: jpg"]);

        let report = v.validate(&upload("report.pdf", "application/pdf", b"not a pdf"), IMAGES, &ctx);
        assert!(!report.valid);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my holiday photo.png"), "my_holiday_photo.png");
        assert_eq!(sanitize_filename("invoice.2024.final.pdf"), "invoice_2024_final.pdf");
        assert_eq!(sanitize_filename("..\\..\\evil<1>.png"), "evil1.png");
        assert_eq!(sanitize_filename(".htaccess"), "htaccess");

        let long = format!("{}.pdf", "é".repeat(200));
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.len() <= 255);
        assert!(sanitized.ends_with(".pdf"));
        assert!(check_filename(&sanitized).is_ok());
    }

    fn fake_clamd(reply: &'static [u8]) -> (String, std::thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut command = [0u8; 10];
            stream.read_exact(&mut command).unwrap();
            assert_eq!(&command, b"zINSTREAM\0");

            let mut received = Vec::new();
            loop {
                let mut len = [0u8; 4];
                stream.read_exact(&mut len).unwrap();
                let len = u32::from_be_bytes(len) as usize;
                if len == 0 {
                    break;
                }
                let mut chunk = vec![0u8; len];
                stream.read_exact(&mut chunk).unwrap();
                received.extend_from_slice(&chunk);
            }
            stream.write_all(reply).unwrap();
            received
        });
        (addr, handle)
    }

    #[test]
    fn test_clamd_instream_protocol() {
        let (addr, server) = fake_clamd(b"stream: Eicar-Test-Signature FOUND\0");
        let clamd = ClamdScanner::new(addr, Duration::from_secs(5));
        let verdict = clamd.scan(b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR").unwrap();
        assert_eq!(verdict, ScanVerdict::Infected("Eicar-Test-Signature".into()));
        assert_eq!(server.join().unwrap(), b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR");

        let (addr, server) = fake_clamd(b"stream: OK\0");
        let config = UploadConfig {
            clamd_addr: Some(addr),
            ..UploadConfig::default()
        };
        let report = UploadValidator::new(config)
            .unwrap()
            .validate(&upload("photo.png", "image/png", PNG), IMAGES, &RequestContext::default());
        assert!(report.valid);
        assert!(!report.flagged);
        assert_eq!(server.join().unwrap(), PNG);
    }

    #[test]
    fn test_unreachable_clamd_degrades_to_flagged() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let clamd = ClamdScanner::new(addr, Duration::from_secs(1));
        assert!(matches!(clamd.scan(b"data"), Err(Error::Unavailable(_))));

        let report = validator()
            .with_scanner(Arc::new(clamd))
            .validate(&upload("photo.png", "image/png", PNG), IMAGES, &RequestContext::default());
        assert!(report.valid);
        assert!(report.flagged);
        assert!(matches!(ClamdScanner::parse_reply(b"garbage"), Err(Error::Unavailable(_))));
    }
}
