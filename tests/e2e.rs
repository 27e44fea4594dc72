use anyhow::Result;
use rftp::protocol::timeouts::Timeouts;
use rftp::protocol_core::{receive_framed, send_framed};
use rftp::{Client, ClientConfig, Command, FtpError, Message, Server, ServerConfig};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

fn write_file(path: &Path, size: usize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    let mut val: u8 = 0;
    let buf: Vec<u8> = (0..size)
        .map(|_| {
            val = val.wrapping_mul(31).wrapping_add(7);
            val
        })
        .collect();
    f.write_all(&buf)?;
    Ok(())
}

async fn start_server(root: &Path, concurrent: bool) -> Result<SocketAddr> {
    let config = ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        root: root.to_path_buf(),
        concurrent_sessions: concurrent,
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await?;
    let addr = server.local_addr()?;
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    Ok(addr)
}

async fn connect(addr: SocketAddr, download_dir: &Path) -> Result<Client> {
    let config = ClientConfig {
        download_dir: download_dir.to_path_buf(),
        ..ClientConfig::new(addr.to_string())
    };
    let mut client = Client::new(config);
    client.connect().await?;
    Ok(client)
}

fn remote_text(err: FtpError) -> String {
    match err {
        FtpError::Remote(text) => text,
        other => panic!("expected a server error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfer_integrity_across_chunk_boundaries() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let addr = start_server(srv.path(), false).await?;
    let mut client = connect(addr, downloads.path()).await?;

    for size in [0usize, 1, 8191, 8192, 8193, 1_000_000] {
        let name = format!("f{}.bin", size);
        let src = local.path().join(&name);
        write_file(&src, size)?;

        assert_eq!(client.upload_file(&src).await?, size as u64);
        assert_eq!(std::fs::read(srv.path().join(&name))?, std::fs::read(&src)?);

        let got = client.download_file(&name).await?;
        assert_eq!(got, downloads.path().join(&name));
        assert_eq!(std::fs::read(&got)?, std::fs::read(&src)?);
    }

    client.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn navigate_into_subdirectory_and_back() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    std::fs::create_dir(srv.path().join("sub"))?;
    std::fs::create_dir(srv.path().join("sub/inner"))?;
    write_file(&srv.path().join("sub/a.txt"), 3)?;
    let addr = start_server(srv.path(), false).await?;
    let mut client = connect(addr, downloads.path()).await?;

    assert_eq!(client.change_directory("/sub").await?, "/sub");
    assert_eq!(client.list_files().await?, vec!["../", "inner/", "a.txt"]);
    assert_eq!(client.print_working_directory().await?, "/sub");
    assert_eq!(client.change_directory("..").await?, "/");
    assert_eq!(client.list_files().await?, vec!["sub/"]);

    // The root is a floor, not a wall to climb over
    for _ in 0..3 {
        let err = client.change_directory("..").await.unwrap_err();
        assert_eq!(remote_text(err), "Access denied: path escapes root");
    }
    assert_eq!(client.print_working_directory().await?, "/");
    assert!(client.is_connected());

    client.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_file_round_trip() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let addr = start_server(srv.path(), false).await?;
    let mut client = connect(addr, downloads.path()).await?;

    let src = local.path().join("empty.txt");
    std::fs::File::create(&src)?;
    assert_eq!(client.upload_file(&src).await?, 0);
    assert_eq!(std::fs::metadata(srv.path().join("empty.txt"))?.len(), 0);

    let got = client.download_file("empty.txt").await?;
    assert_eq!(std::fs::metadata(got)?.len(), 0);

    client.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_with_separator_is_refused() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    std::fs::create_dir(srv.path().join("a"))?;
    let addr = start_server(srv.path(), false).await?;
    let mut client = connect(addr, downloads.path()).await?;

    let src = local.path().join("b.txt");
    write_file(&src, 20_000)?;
    let err = client.upload_file_as(&src, "a/b.txt").await.unwrap_err();
    assert_eq!(remote_text(err), "Invalid filename: Cannot contain path separators");
    assert!(!srv.path().join("a/b.txt").exists());

    // The rejected body was drained; the session is still in step
    assert!(client.is_connected());
    assert_eq!(client.print_working_directory().await?, "/");

    client.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_command_preconditions() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    std::fs::create_dir(srv.path().join("dir"))?;
    write_file(&srv.path().join("file.txt"), 10)?;
    let addr = start_server(srv.path(), false).await?;
    let mut client = connect(addr, downloads.path()).await?;

    let err = client.create_directory("dir").await.unwrap_err();
    assert_eq!(remote_text(err), "Directory already exists");

    let err = client.remove_directory("missing").await.unwrap_err();
    assert_eq!(remote_text(err), "Directory does not exist");

    let err = client.remove_directory("file.txt").await.unwrap_err();
    assert_eq!(remote_text(err), "Path is not a directory");

    let err = client.delete_file("dir").await.unwrap_err();
    assert_eq!(remote_text(err), "Path is not a regular file");

    let err = client.download_file("missing.txt").await.unwrap_err();
    assert_eq!(remote_text(err), "File does not exist");
    assert_eq!(std::fs::read_dir(downloads.path())?.count(), 0);

    client.create_directory("new").await?;
    std::fs::write(srv.path().join("new/x"), b"x")?;
    client.remove_directory("new").await?;
    client.delete_file("file.txt").await?;
    assert!(!srv.path().join("new").exists());
    assert!(!srv.path().join("file.txt").exists());

    client.quit().await?;
    Ok(())
}

/// Accept one connection and hand it to `script`.
async fn fake_server<F, Fut>(script: F) -> Result<SocketAddr>
where
    F: FnOnce(tokio::net::TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            script(stream).await;
        }
    });
    Ok(addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncated_download_leaves_no_file() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let addr = fake_server(|mut stream| async move {
        let t = Timeouts::default();
        let req = receive_framed(&mut stream, 5_000, &t).await.unwrap();
        assert_eq!(req.command, Command::Download);
        let header = Message::new(Command::Download, "").with_data_size(100);
        send_framed(&mut stream, &header, &t).await.unwrap();
        stream.write_all(&[7u8; 10]).await.unwrap();
        let _ = stream.shutdown().await;
    })
    .await?;

    let mut client = connect(addr, downloads.path()).await?;
    let err = client.download_file("big.bin").await.unwrap_err();
    assert!(matches!(err, FtpError::Connection(_)), "{:?}", err);
    assert!(!client.is_connected());
    assert_eq!(std::fs::read_dir(downloads.path())?.count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_response_tag_is_reported() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let addr = fake_server(|mut stream| async move {
        let t = Timeouts::default();
        let req = receive_framed(&mut stream, 5_000, &t).await.unwrap();
        assert_eq!(req.command, Command::Mkdir);
        send_framed(&mut stream, &Message::new(Command::List, "x/"), &t)
            .await
            .unwrap();
        let req = receive_framed(&mut stream, 5_000, &t).await.unwrap();
        assert_eq!(req.command, Command::Pwd);
        send_framed(&mut stream, &Message::new(Command::Pwd, "/"), &t)
            .await
            .unwrap();
    })
    .await?;

    let mut client = connect(addr, downloads.path()).await?;
    let err = client.create_directory("x").await.unwrap_err();
    assert!(matches!(
        err,
        FtpError::ProtocolViolation {
            expected: Command::Mkdir,
            actual: Command::List
        }
    ));
    assert!(client.is_connected());
    assert_eq!(client.print_working_directory().await?, "/");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_server_serves_one_client_at_a_time() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let addr = start_server(srv.path(), false).await?;

    let mut first = connect(addr, downloads.path()).await?;
    assert_eq!(first.print_working_directory().await?, "/");

    // The second connection is accepted by the kernel but not yet served
    let t = Timeouts::default();
    let mut second = tokio::net::TcpStream::connect(addr).await?;
    send_framed(&mut second, &Message::new(Command::Pwd, ""), &t).await?;
    let waiting = tokio::time::timeout(
        Duration::from_millis(300),
        receive_framed(&mut second, 5_000, &t),
    )
    .await;
    assert!(waiting.is_err());

    first.quit().await?;
    let resp = receive_framed(&mut second, 5_000, &t).await?;
    assert_eq!(resp, Message::new(Command::Pwd, "/"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_server_serves_clients_side_by_side() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    std::fs::create_dir(srv.path().join("sub"))?;
    let addr = start_server(srv.path(), true).await?;

    let mut first = connect(addr, downloads.path()).await?;
    let mut second = connect(addr, downloads.path()).await?;
    assert_eq!(first.change_directory("sub").await?, "/sub");
    // Working directories are per session
    assert_eq!(second.print_working_directory().await?, "/");
    assert_eq!(first.print_working_directory().await?, "/sub");

    first.quit().await?;
    second.quit().await?;
    Ok(())
}
