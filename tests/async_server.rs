//! Blocking clients against the tokio simulator server

use std::time::Duration;

use deapi::io::{AsyncSimulatorServer, ClientBuilder};
use deapi::protocol::{FrameType, Parameter, PixelFormat};
use deapi::simulator::Simulator;
use tokio_test::assert_ok;

async fn start() -> u16 {
    let shared = Simulator::with_defaults().unwrap().into_shared();
    let server = AsyncSimulatorServer::bind("127.0.0.1:0", shared).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());
    port
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_property_cycle_async_server() {
    let port = start().await;
    let result = tokio::task::spawn_blocking(move || {
        let mut client = ClientBuilder::new().tcp("127.0.0.1", port).build()?;
        client.set_property("Scan - Size X", 256)?;
        client.get_property("Scan - Size X")
    })
    .await
    .unwrap();
    assert_eq!(assert_ok!(result), Parameter::Int(256));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_clients_async_server() {
    let port = start().await;
    let workers: Vec<_> = (0..4)
        .map(|i| {
            tokio::task::spawn_blocking(move || {
                let mut client = ClientBuilder::new().tcp("127.0.0.1", port).build()?;
                let size = 16 * (i + 1);
                let frame = client.get_result(
                    FrameType::SumTotal,
                    PixelFormat::Float32,
                    Some(deapi::protocol::Attributes::with_window(size, size)),
                    None,
                )?;
                Ok::<_, deapi::DeError>((size, frame.image.shape()))
            })
        })
        .collect();

    for worker in workers {
        let (size, shape) = assert_ok!(worker.await.unwrap());
        assert_eq!(shape, [size as usize, size as usize]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_datagram_async_server() {
    let port = start().await;
    let result = tokio::task::spawn_blocking(move || {
        let mut client = ClientBuilder::new()
            .tcp("127.0.0.1", port)
            .base_timeout(Duration::from_secs(5))
            .build()?;
        client.set_property("Frames Per Second", 1.0)?;
        client.start_acquisition(10, false)?;
        let was_acquiring = client.acquiring()?;
        let stopped = client.stop_acquisition()?;
        Ok::<_, deapi::DeError>((was_acquiring, stopped, client.acquiring()?))
    })
    .await
    .unwrap();
    assert_eq!(assert_ok!(result), (true, true, false));
}
