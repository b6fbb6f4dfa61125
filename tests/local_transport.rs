//! The same client code over the in-process transport

use deapi::io::{ClientBuilder, SimulatorServer};
use deapi::protocol::{FrameType, PixelFormat};
use deapi::simulator::{Simulator, SimulatorConfig};

#[test]
fn test_simulated_client_without_sockets() {
    let mut client = ClientBuilder::new()
        .simulated(Simulator::with_defaults().unwrap())
        .build()
        .unwrap();
    client.set_hw_roi(0, 0, 128, 64).unwrap();
    client.set_property("Frames Per Second", 1000.0).unwrap();

    let image = client.get_image(PixelFormat::Float32).unwrap();
    assert_eq!(image.shape(), [64, 128]);
}

#[test]
fn test_custom_camera_name() {
    let config = SimulatorConfig {
        camera_name: "Bench Camera".to_string(),
        ..Default::default()
    };
    let client = ClientBuilder::new()
        .simulated(Simulator::new(config).unwrap())
        .build()
        .unwrap();
    assert_eq!(client.current_camera(), "Bench Camera");
}

#[test]
fn test_local_and_tcp_share_one_simulator() {
    let shared = Simulator::with_defaults().unwrap().into_shared();
    let server = SimulatorServer::bind("127.0.0.1:0", shared.clone()).unwrap();
    let (addr, _handle) = server.spawn().unwrap();

    let mut local = ClientBuilder::new().shared_simulator(shared).build().unwrap();
    let mut remote = ClientBuilder::new().tcp("127.0.0.1", addr.port()).build().unwrap();

    local.set_property("Scan - Size Y", 32).unwrap();
    remote.update_sizes().unwrap();
    assert_eq!(remote.scan_size(), (128, 32));

    // a stop through the local handle ends an acquisition the remote started
    remote.set_property("Frames Per Second", 1.0).unwrap();
    remote.start_acquisition(10, false).unwrap();
    assert!(local.stop_acquisition().unwrap());
    assert!(!remote.acquiring().unwrap());

    let frame = remote
        .get_result(FrameType::SingleFrameIntegrated, PixelFormat::Auto, None, None)
        .unwrap();
    assert_eq!(frame.pixel_format, PixelFormat::Uint16);
}
