//! Integration tests against the simulator served over TCP
//!
//! Each test starts its own blocking server on an ephemeral port.

use std::thread;
use std::time::{Duration, Instant};

use deapi::io::{ClientBuilder, SimulatorServer, TcpTransport};
use deapi::io::Client;
use deapi::protocol::{Attributes, FrameType, Histogram, MovieBufferStatus, Parameter, PixelFormat};
use deapi::simulator::{self, SharedSimulator, Simulator};
use deapi::DeError;
use rstest::rstest;

fn start_server() -> (u16, SharedSimulator) {
    let shared = Simulator::with_defaults().unwrap().into_shared();
    let server = SimulatorServer::bind("127.0.0.1:0", shared.clone()).unwrap();
    let (addr, _handle) = server.spawn().unwrap();
    (addr.port(), shared)
}

fn connect() -> (Client<TcpTransport>, SharedSimulator) {
    let (port, shared) = start_server();
    let client = ClientBuilder::new()
        .tcp("127.0.0.1", port)
        .connect_timeout(Duration::from_secs(2))
        .base_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    (client, shared)
}

#[test]
fn test_simple_property_cycle() {
    let (mut client, _) = connect();
    client.set_property("Scan - Size X", 256).unwrap();
    assert_eq!(client.get_property("Scan - Size X").unwrap(), Parameter::Int(256));
}

#[rstest]
#[case::integer("Grab Buffer Size", Parameter::Int(64))]
#[case::float("Frames Per Second", Parameter::Float(250.5))]
#[case::string_set("Exposure Mode", Parameter::Str("Dark".into()))]
#[case::string_free("Autosave Directory", Parameter::Str("/data/run 7".into()))]
#[case::boolean("Autosave Debug Frames", Parameter::Bool(true))]
fn test_property_round_trip(#[case] name: &str, #[case] value: Parameter) {
    let (mut client, _) = connect();
    client.set_property(name, value.clone()).unwrap();
    assert_eq!(client.get_property(name).unwrap(), value);
}

#[rstest]
#[case::above_range("Scan - Size X", Parameter::Int(4097))]
#[case::below_range("Frames Per Second", Parameter::Float(0.01))]
#[case::outside_set("Exposure Mode", Parameter::Str("Z".into()))]
#[case::read_only("Camera SN", Parameter::Str("other".into()))]
fn test_invalid_write_keeps_value(#[case] name: &str, #[case] value: Parameter) {
    let (mut client, _) = connect();
    let before = client.get_property(name).unwrap();
    client.set_property(name, value).unwrap();
    assert_eq!(client.get_property(name).unwrap(), before);
}

#[test]
fn test_linked_properties_follow_hw_roi() {
    let (mut client, _) = connect();
    let changed = client.set_hw_roi_and_get_changed(256, 0, 512, 1024).unwrap();
    assert_eq!(changed["Hardware ROI Offset X"], "256");
    assert_eq!(changed["Image Size X (pixels)"], "512");
    assert!(!changed.contains_key("Hardware ROI Size Y"));

    client.set_property("Hardware Binning X", 2).unwrap();
    assert_eq!(client.get_property("Image Size X (pixels)").unwrap().to_i64(), Some(256));
    assert_eq!(client.get_property("Crop Size X").unwrap().to_i64(), Some(256));
}

#[test]
fn test_unknown_property_is_reported() {
    let (mut client, _) = connect();
    match client.get_property("No Such Property") {
        Err(DeError::Server(msg)) => assert!(msg.starts_with("Unknown property"), "{}", msg),
        other => panic!("expected server error, got {:?}", other),
    }
    assert!(client.is_connected());
    assert!(client.get_property("Camera SN").is_ok());
}

#[test]
fn test_property_spec_and_valid_values() {
    let (mut client, _) = connect();
    let spec = client.property_spec("Exposure Mode").unwrap();
    assert_eq!(spec.value_type, "Set");
    assert_eq!(spec.default_value, "Normal");
    assert!(spec.options.contains(&"Normal*".to_string()));

    let spec = client.property_spec("Grab Buffer Size").unwrap();
    assert_eq!(spec.value_type, "Range");
    assert_eq!(spec.options.last().map(String::as_str), Some("1 - 1024"));

    // dataType, valueType, four options, category, default, current
    let values = client.property_valid_values("Binning X").unwrap();
    assert_eq!(values.len(), 9);
    assert_eq!(values[5], Parameter::Str("8".into()));
}

#[test]
fn test_groups_and_search() {
    let (mut client, _) = connect();
    let scan = client.property_groups().members("scan");
    assert!(scan.contains(&"Scan - Enable"));
    let temperature = client.list_properties_matching("Temperature").unwrap();
    assert_eq!(temperature.len(), 2);
}

#[test]
fn test_acquisition_lifecycle() {
    let (mut client, _) = connect();
    client.set_property("Frames Per Second", 100.0).unwrap();
    // 5 repeats of 5 frames at 100 fps
    client.start_acquisition(5, false).unwrap();
    assert!(client.acquiring().unwrap());
    assert_eq!(
        client.get_property("Acquisition Status").unwrap(),
        Parameter::Str("Acquiring".into())
    );

    let mut polls = 0;
    while client.acquiring().unwrap() {
        polls += 1;
        assert!(polls < 100, "acquisition never finished");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        client.get_property("Acquisition Status").unwrap(),
        Parameter::Str("Idle".into())
    );
}

#[test]
fn test_stop_datagram_from_another_thread() {
    let (mut client, shared) = connect();
    client.set_property("Frames Per Second", 1.0).unwrap();
    client.start_acquisition(10, false).unwrap();
    assert!(client.acquiring().unwrap());

    let started = Instant::now();
    let handle = client.stop_handle();
    let stopped = thread::spawn(move || handle.send()).join().unwrap().unwrap();
    assert!(stopped);
    assert!(!client.acquiring().unwrap());
    assert!(!simulator::lock(&shared).acquiring());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[rstest]
#[case::sum_total(FrameType::SumTotal, PixelFormat::Auto, (64, 32), PixelFormat::Float32)]
#[case::single_frame(FrameType::SingleFrameIntegrated, PixelFormat::Auto, (100, 50), PixelFormat::Uint16)]
#[case::forced_u8(FrameType::SingleFrameIntegrated, PixelFormat::Uint8, (20, 10), PixelFormat::Uint8)]
#[case::mask_is_u8(FrameType::VirtualMask1, PixelFormat::Float32, (16, 16), PixelFormat::Uint8)]
fn test_result_shape(
    #[case] frame_type: FrameType,
    #[case] requested: PixelFormat,
    #[case] window: (i64, i64),
    #[case] expected: PixelFormat,
) {
    let (mut client, _) = connect();
    client.set_property("Frames Per Second", 1000.0).unwrap();
    client.start_acquisition(1, false).unwrap();
    let frame = client
        .get_result(
            frame_type,
            requested,
            Some(Attributes::with_window(window.0, window.1)),
            None,
        )
        .unwrap();
    assert_eq!(frame.image.shape(), [window.1 as usize, window.0 as usize]);
    assert_eq!(frame.pixel_format, expected);
    assert_eq!(frame.image.pixel_format(), expected);
    assert_eq!(frame.attributes.frame_width, window.0);
    assert_eq!(frame.attributes.dataset_name, "Fake Test Camera");
}

#[test]
fn test_result_histogram_over_tcp() {
    let (mut client, _) = connect();
    let request = Histogram {
        bins: 32,
        ..Default::default()
    };
    let frame = client
        .get_result(
            FrameType::SumTotal,
            PixelFormat::Float32,
            Some(Attributes::with_window(40, 20)),
            Some(request),
        )
        .unwrap();
    let histogram = frame.histogram.unwrap();
    assert_eq!(histogram.bins, 32);
    assert_eq!(histogram.data.iter().sum::<i64>(), 40 * 20);
    assert!(histogram.min <= histogram.max);
}

#[test]
fn test_virtual_image_uses_mask() {
    let (mut client, _) = connect();
    client.set_property("Scan - Size X", 8).unwrap();
    client.set_property("Scan - Size Y", 4).unwrap();
    client.set_property("Scan - Enable", "On").unwrap();
    client.set_property("Frames Per Second", 1000.0).unwrap();
    client.set_hw_roi(0, 0, 32, 32).unwrap();

    client.set_virtual_mask(0, 32, 32, &[2u8; 32 * 32]).unwrap();
    client.start_acquisition(1, false).unwrap();
    let all = client
        .get_result(FrameType::VirtualImage0, PixelFormat::Auto, None, None)
        .unwrap();
    assert_eq!(all.image.shape(), [4, 8]);

    client.set_virtual_mask(0, 32, 32, &[1u8; 32 * 32]).unwrap();
    let none = client
        .get_result(FrameType::VirtualImage0, PixelFormat::Auto, None, None)
        .unwrap();
    assert_eq!(none.attributes.image_max, 0.0);
    assert!(all.attributes.image_max > 0.0);
}

#[test]
fn test_movie_buffer_over_tcp() {
    let (mut client, _) = connect();
    client.set_hw_roi(0, 0, 16, 16).unwrap();
    client.set_property("Grab Buffer Size", 4).unwrap();
    client.set_property("Frames Per Second", 1.0).unwrap();

    let idle = client.get_movie_buffer(1 << 20, 1000).unwrap();
    assert_eq!(idle.status, MovieBufferStatus::Finished);

    client.start_acquisition(10, true).unwrap();
    let buffer = client.get_movie_buffer(1 << 20, 1000).unwrap();
    assert_eq!(buffer.status, MovieBufferStatus::Ok);
    assert_eq!(buffer.num_frames, 4);
    assert_eq!(buffer.data.len(), 16 * 16 * 4 * 2);
    assert!(client.stop_acquisition().unwrap());
}

#[test]
fn test_disconnect_then_call_fails() {
    let (mut client, _) = connect();
    client.disconnect();
    assert!(!client.is_connected());
    assert!(matches!(
        client.get_property("Camera SN"),
        Err(DeError::NotConnected)
    ));
}
