//! Echo over smux - one TCP connection, many streams.
//!
//! This example demonstrates:
//! - Starting a server session on an accepted TCP connection
//! - Echoing every accepted stream until the peer closes it
//! - Opening several concurrent streams from a client session
//!
//! # Running
//!
//! ```text
//! cargo run --example echo
//! ```

use smux::{Session, Stream};
use tokio::net::{TcpListener, TcpStream};

const STREAMS: usize = 8;

async fn echo(stream: Stream) -> smux::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
    }
    stream.close().await
}

async fn serve(listener: TcpListener) -> smux::Result<()> {
    let (conn, _) = listener.accept().await?;
    let session = Session::builder().version(2).server(conn)?;

    loop {
        let stream = match session.accept_stream().await {
            Ok(stream) => stream,
            Err(_) if session.is_closed() => return Ok(()),
            Err(e) => return Err(e),
        };
        tokio::spawn(async move {
            if let Err(e) = echo(stream).await {
                eprintln!("echo failed: {}", e);
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(serve(listener));

    let conn = TcpStream::connect(addr).await?;
    let session = Session::builder().version(2).client(conn)?;

    let mut tasks = Vec::new();
    for i in 0..STREAMS {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let stream = session.open_stream().await?;
            let message = format!("hello from stream {}", i).repeat(1000);
            stream.write_all(message.as_bytes()).await?;

            let mut back = vec![0u8; message.len()];
            let mut filled = 0;
            while filled < back.len() {
                match stream.read(&mut back[filled..]).await? {
                    0 => break,
                    n => filled += n,
                }
            }
            stream.close().await?;
            Ok::<_, smux::SmuxError>((stream.id(), back == message.as_bytes()))
        }));
    }

    for task in tasks {
        let (id, ok) = task.await??;
        println!("stream {:>2}: {}", id, if ok { "echoed" } else { "MISMATCH" });
    }

    session.close()?;
    server.await??;
    Ok(())
}
