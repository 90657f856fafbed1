use std::io::{Read as _, Write as _};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use berth_fetch::{fetch_http_artifact, ArchiveFetchError, HttpArtifact, HttpFetchOptions};

fn create_temp_dir(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

fn rm_rf(path: &std::path::Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// One-shot HTTP server returning `body` for the first request, then exiting.
fn serve_once(body: Vec<u8>) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let addr = listener.local_addr().expect("local_addr");

    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));

        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        for _ in 0..64 {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&tmp[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let header = format!(
            "HTTP/1.1 200 OK\r\n\
Content-Type: application/octet-stream\r\n\
Content-Length: {}\r\n\
Connection: close\r\n\
\r\n",
            body.len()
        );
        stream.write_all(header.as_bytes()).expect("write header");
        stream.write_all(&body).expect("write body");
        let _ = stream.flush();
    });

    format!("http://{addr}")
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, bytes) in entries {
            writer.start_file(*name, options).expect("start zip entry");
            writer.write_all(bytes).expect("write zip entry");
        }
        writer.finish().expect("finish zip");
    }
    cursor.into_inner()
}

/// Hand-built single-entry tar whose member path climbs out of the target.
/// The tar writer refuses to produce this shape, which is exactly why the
/// reader has to defend against it.
fn evil_tar_bytes() -> Vec<u8> {
    let name = b"../evil.txt";
    let mut header = [0u8; 512];
    header[..name.len()].copy_from_slice(name);
    header[100..108].copy_from_slice(b"0000644\0");
    header[108..116].copy_from_slice(b"0000000\0");
    header[116..124].copy_from_slice(b"0000000\0");
    header[124..136].copy_from_slice(b"00000000005\0");
    header[136..148].copy_from_slice(b"00000000000\0");
    for b in &mut header[148..156] {
        *b = b' ';
    }
    header[156] = b'0';
    let sum: u32 = header.iter().map(|&b| u32::from(b)).sum();
    let chksum = format!("{:06o}\0 ", sum);
    header[148..156].copy_from_slice(chksum.as_bytes());

    let mut out = Vec::new();
    out.extend_from_slice(&header);
    let mut data = [0u8; 512];
    data[..5].copy_from_slice(b"hello");
    out.extend_from_slice(&data);
    out.extend_from_slice(&[0u8; 1024]);
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest as _, Sha256};
    let mut h = Sha256::new();
    h.update(bytes);
    let digest = h.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[test]
fn unpacks_zip_by_extension() {
    let body = zip_bytes(&[("a/x.txt", b"from a"), ("b/y.txt", b"from b")]);
    let base = serve_once(body);
    let target = create_temp_dir("berth_zip_ok");

    let spec = HttpArtifact {
        url: format!("{base}/pkg.zip"),
        dest: None,
        sha256: None,
        unpack: false,
    };
    fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).expect("fetch");

    assert_eq!(std::fs::read(target.join("a/x.txt")).expect("read a"), b"from a");
    assert_eq!(std::fs::read(target.join("b/y.txt")).expect("read b"), b"from b");
    rm_rf(&target);
}

#[test]
fn flattens_single_top_level_dir() {
    let body = zip_bytes(&[
        ("pkg-1.0/readme.md", b"docs" as &[u8]),
        ("pkg-1.0/src/m.txt", b"m"),
    ]);
    let base = serve_once(body);
    let target = create_temp_dir("berth_zip_flatten");

    let spec = HttpArtifact {
        url: format!("{base}/pkg-1.0.zip"),
        dest: None,
        sha256: None,
        unpack: false,
    };
    fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).expect("fetch");

    assert!(target.join("readme.md").is_file());
    assert!(target.join("src/m.txt").is_file());
    assert!(!target.join("pkg-1.0").exists());
    rm_rf(&target);
}

#[test]
fn sha256_mismatch_fails_before_extraction() {
    let body = zip_bytes(&[("x.txt", b"content")]);
    let base = serve_once(body);
    let target = create_temp_dir("berth_zip_badsum");

    let spec = HttpArtifact {
        url: format!("{base}/pkg.zip"),
        dest: None,
        sha256: Some("0".repeat(64)),
        unpack: false,
    };
    let err = fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).unwrap_err();
    assert!(
        matches!(err, ArchiveFetchError::Integrity { .. }),
        "expected integrity error, got: {err}"
    );
    assert!(!err.retryable());
    assert!(!target.join("x.txt").exists(), "must not extract on mismatch");
    rm_rf(&target);
}

#[test]
fn sha256_match_accepts_case_insensitive() {
    let payload = b"raw bytes".to_vec();
    let digest = sha256_hex(&payload).to_uppercase();
    let base = serve_once(payload.clone());
    let target = create_temp_dir("berth_raw_sum");

    let spec = HttpArtifact {
        url: format!("{base}/data.bin"),
        dest: Some("vendor/data.bin".to_string()),
        sha256: Some(digest),
        unpack: false,
    };
    fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).expect("fetch");
    assert_eq!(
        std::fs::read(target.join("vendor/data.bin")).expect("read dest"),
        payload
    );
    rm_rf(&target);
}

#[test]
fn zip_slip_entry_aborts_and_writes_nothing_outside() {
    let body = zip_bytes(&[("../evil.txt", b"pwn")]);
    let base = serve_once(body);
    let outer = create_temp_dir("berth_zip_slip");
    let target = outer.join("inner");

    let spec = HttpArtifact {
        url: format!("{base}/pkg.zip"),
        dest: None,
        sha256: None,
        unpack: false,
    };
    let err = fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).unwrap_err();
    assert!(
        matches!(err, ArchiveFetchError::UnsafePath { .. }),
        "expected unsafe-path error, got: {err}"
    );
    assert!(!outer.join("evil.txt").exists(), "escaped the target dir");
    assert!(!target.join("evil.txt").exists());
    rm_rf(&outer);
}

#[test]
fn tar_slip_entry_aborts_and_writes_nothing_outside() {
    let base = serve_once(evil_tar_bytes());
    let outer = create_temp_dir("berth_tar_slip");
    let target = outer.join("inner");

    let spec = HttpArtifact {
        url: format!("{base}/pkg.tar"),
        dest: None,
        sha256: None,
        unpack: false,
    };
    let err = fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).unwrap_err();
    assert!(
        matches!(err, ArchiveFetchError::UnsafePath { .. }),
        "expected unsafe-path error, got: {err}"
    );
    assert!(!outer.join("evil.txt").exists(), "escaped the target dir");
    rm_rf(&outer);
}

#[test]
fn dest_escaping_target_is_rejected() {
    let base = serve_once(b"payload".to_vec());
    let outer = create_temp_dir("berth_dest_slip");
    let target = outer.join("inner");

    let spec = HttpArtifact {
        url: format!("{base}/data.bin"),
        dest: Some("../out.bin".to_string()),
        sha256: None,
        unpack: false,
    };
    let err = fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).unwrap_err();
    assert!(matches!(err, ArchiveFetchError::UnsafePath { .. }));
    assert!(!outer.join("out.bin").exists());
    rm_rf(&outer);
}

#[test]
fn unpack_flag_on_garbage_is_unknown_format() {
    let base = serve_once(b"not an archive at all".to_vec());
    let target = create_temp_dir("berth_garbage");

    let spec = HttpArtifact {
        url: format!("{base}/blob"),
        dest: None,
        sha256: None,
        unpack: true,
    };
    let err = fetch_http_artifact(&spec, &target, &HttpFetchOptions::default()).unwrap_err();
    assert!(
        matches!(err, ArchiveFetchError::UnknownFormat { .. }),
        "expected unknown-format error, got: {err}"
    );
    rm_rf(&target);
}
