//! Fake PostgreSQL client tools and a tiny HTTP responder for integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use postgres::version::PgVersion;
use postgres::PostgresManager;

/// A tools root populated with shell scripts standing in for pg_dump and psql.
pub struct FakeTools {
    pub dir: TempDir,
}

impl FakeTools {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Path to a scratch file next to the tools, for scripts to write into.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Installs `<root>/<version>/bin/<tool>` running `body` under /bin/sh.
    pub fn install(&self, version: PgVersion, tool: &str, body: &str) -> PathBuf {
        let bin = self.root().join(version.label()).join("bin");
        fs::create_dir_all(&bin).expect("create bin dir");
        let path = bin.join(tool);
        {
            let mut file = fs::File::create(&path).expect("create script");
            writeln!(file, "#!/bin/sh\n{body}").expect("write script");
            file.sync_all().expect("sync script");
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
        path
    }

    pub fn manager(&self) -> PostgresManager {
        PostgresManager::new(self.root()).with_channel_capacity(4)
    }
}

/// Serves `body` with `status` to the first request and returns the URL.
pub async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.expect("read request");
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }

        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/zip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
        let _ = socket.shutdown().await;
    });

    format!("http://{addr}/dumps/latest.zip")
}

/// Accepts one connection and never answers it, returning the URL.
pub async fn serve_stalled() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.expect("accept");
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    });

    format!("http://{addr}/dumps/latest.zip")
}

/// Builds a ZIP with the given entries using the reference implementation.
pub fn zip_with_entries(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(data).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Deterministic SQL of roughly `lines * 40` bytes.
pub fn sample_sql(lines: usize) -> Vec<u8> {
    let mut sql = b"CREATE TABLE items (id integer, name text);\n".to_vec();
    for i in 0..lines {
        sql.extend_from_slice(format!("INSERT INTO items VALUES ({i}, 'item-{i}');\n").as_bytes());
    }
    sql
}

/// Builds an archive the way Go's archive/zip stores uncompressed files: each
/// entry's CRC and sizes follow its data in a data descriptor.
pub fn stored_with_descriptors(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in entries {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0x0008u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 18]);
    out
}
