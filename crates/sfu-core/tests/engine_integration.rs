//! End-to-end scenarios through the assembled engine: ingress packets in,
//! paced packets out, RTCP feedback steering simulcast layers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use confero_rtp_core::packet::rtcp::RtcpPacket;
use confero_rtp_core::packet::rtcp::{RtcpPli, RtcpReceiverReport, RtcpRemb, RtcpReportBlock};
use confero_rtp_core::{RtpSsrc, SimulcastLayer};
use confero_sfu_core::types::KeyframeRequestSink;
use confero_sfu_core::{RtpStreamInfo, SfuEngine, SfuEngineConfig};

fn dest() -> SocketAddr {
    "10.0.0.2:5000".parse().unwrap()
}

fn rtp_packet(ssrc: RtpSsrc, payload_type: u8, len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; len];
    packet[0] = 0x80;
    packet[1] = payload_type;
    packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

struct SocketRecorder {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

fn engine_with_recorder() -> (Arc<SfuEngine>, Arc<SocketRecorder>) {
    let engine = SfuEngine::new(SfuEngineConfig::default());
    let recorder = Arc::new(SocketRecorder {
        sent: Mutex::new(Vec::new()),
    });
    let r = Arc::clone(&recorder);
    engine.set_socket_sink(move |data: &[u8], destination: SocketAddr| {
        r.sent.lock().unwrap().push((data.to_vec(), destination));
    });
    (engine, recorder)
}

#[test]
fn test_single_forward_end_to_end() {
    let (engine, recorder) = engine_with_recorder();

    engine
        .register_publisher(
            &"pub".to_string(),
            &"mic".to_string(),
            RtpStreamInfo::audio(0xAABBCCDD, 111, "opus"),
            None,
        )
        .unwrap();
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"mic".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    let packet = rtp_packet(0xAABBCCDD, 111, 200);
    engine.on_rtp_packet(0xAABBCCDD, &packet, "1.2.3.4:9999".parse().unwrap());
    engine.process(); // drain the pacer

    let sent = recorder.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, packet, "passthrough is byte-identical");
    assert_eq!(sent[0].1, dest());
}

#[test]
fn test_ssrc_rewrite_end_to_end() {
    let (engine, recorder) = engine_with_recorder();

    engine
        .register_publisher(
            &"pub".to_string(),
            &"mic".to_string(),
            RtpStreamInfo::audio(0xAABBCCDD, 111, "opus"),
            None,
        )
        .unwrap();
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"mic".to_string(),
            dest(),
            0x11223344,
            -1,
        )
        .unwrap();

    let packet = rtp_packet(0xAABBCCDD, 111, 200);
    engine.on_rtp_packet(0xAABBCCDD, &packet, "1.2.3.4:9999".parse().unwrap());
    engine.process();

    let sent = recorder.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let bytes = &sent[0].0;
    assert_eq!(&bytes[..8], &packet[..8]);
    assert_eq!(&bytes[8..12], &[0x11, 0x22, 0x33, 0x44]);
    assert_eq!(&bytes[12..], &packet[12..]);
}

#[test]
fn test_remb_drives_layer_selection() {
    let (engine, _recorder) = engine_with_recorder();

    let layers = vec![
        SimulcastLayer {
            layer_index: 0,
            width: 320,
            height: 180,
            fps: 15,
            bitrate_kbps: 150,
            active: true,
        },
        SimulcastLayer {
            layer_index: 1,
            width: 640,
            height: 360,
            fps: 30,
            bitrate_kbps: 500,
            active: true,
        },
        SimulcastLayer {
            layer_index: 2,
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 1500,
            active: true,
        },
    ];
    for layer in 0..3 {
        engine
            .register_publisher(
                &"pub".to_string(),
                &"cam".to_string(),
                RtpStreamInfo::video_layer(200 + layer as u32, 96, "vp8", layer),
                if layer == 0 { Some(layers.clone()) } else { None },
            )
            .unwrap();
    }
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"cam".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    // Cold start sits on the highest layer
    assert_eq!(
        engine
            .subscriptions()
            .current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
        Some(2)
    );

    // Receiver estimates 800 kbps
    let remb = RtcpPacket::ReceiverEstimatedMaxBitrate(RtcpRemb::new(1, 800_000, vec![200]));
    engine.on_rtcp_packet(&"sub".to_string(), &remb.serialize().unwrap());
    engine.process();

    assert_eq!(
        engine
            .subscriptions()
            .current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
        Some(1),
        "layer 2 overshoots an 800 kbps link, layer 1 fits"
    );
}

#[test]
fn test_layer_selection_sees_moderated_bitrate_not_raw_remb() {
    let (engine, _recorder) = engine_with_recorder();

    for layer in 0..3 {
        engine
            .register_publisher(
                &"pub".to_string(),
                &"cam".to_string(),
                RtpStreamInfo::video_layer(300 + layer as u32, 96, "vp8", layer),
                if layer == 0 {
                    Some(SimulcastLayer::default_layers(1280, 720, 2500))
                } else {
                    None
                },
            )
            .unwrap();
    }
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"cam".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    // A generous 4 Mbps REMB: the controller still climbs from its start
    // bitrate (1 Mbps * 1.08), so selection must not see the raw 4 Mbps
    let remb = RtcpPacket::ReceiverEstimatedMaxBitrate(RtcpRemb::new(1, 4_000_000, vec![300]));
    engine.on_rtcp_packet(&"sub".to_string(), &remb.serialize().unwrap());
    engine.process();

    // Ladder for 2500 kbps total: {0: 250, 1: 750, 2: 1500}. The moderated
    // ~1.08 Mbps estimate fits layer 1 only; raw 4 Mbps would keep layer 2
    assert_eq!(
        engine
            .subscriptions()
            .current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
        Some(1)
    );
}

#[test]
fn test_sustained_loss_walks_the_bitrate_and_layer_down() {
    let (engine, _recorder) = engine_with_recorder();

    for layer in 0..3 {
        engine
            .register_publisher(
                &"pub".to_string(),
                &"cam".to_string(),
                RtpStreamInfo::video_layer(400 + layer as u32, 96, "vp8", layer),
                if layer == 0 {
                    Some(SimulcastLayer::default_layers(1280, 720, 2500))
                } else {
                    None
                },
            )
            .unwrap();
    }
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"cam".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    // 10% loss reported, then repeated REMBs: each update multiplies the
    // controller's rate by 0.85 regardless of the large REMB cap
    let mut rr = RtcpReceiverReport::new(1);
    rr.report_blocks.push(RtcpReportBlock {
        ssrc: 400,
        fraction_lost: 26, // ~10%
        ..RtcpReportBlock::new(400)
    });
    engine.on_rtcp_packet(
        &"sub".to_string(),
        &RtcpPacket::ReceiverReport(rr).serialize().unwrap(),
    );

    let remb = RtcpPacket::ReceiverEstimatedMaxBitrate(RtcpRemb::new(1, 4_000_000, vec![400]));
    for _ in 0..8 {
        engine.on_rtcp_packet(&"sub".to_string(), &remb.serialize().unwrap());
    }
    engine.process();

    // 1 Mbps decayed by 0.85 eight times lands well under layer 1's
    // 750 kbps, and the loss makes the downgrade immediate
    assert_eq!(
        engine
            .subscriptions()
            .current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
        Some(0)
    );
}

#[test]
fn test_pli_reaches_keyframe_sink() {
    let (engine, _recorder) = engine_with_recorder();
    let requested: Arc<Mutex<Vec<RtpSsrc>>> = Arc::new(Mutex::new(Vec::new()));
    let requested_clone = Arc::clone(&requested);
    engine.set_keyframe_request_sink(Arc::new(move |ssrc: RtpSsrc| {
        requested_clone.lock().unwrap().push(ssrc);
    }) as Arc<dyn KeyframeRequestSink>);

    let pli = RtcpPacket::PictureLossIndication(RtcpPli {
        sender_ssrc: 1,
        media_ssrc: 0xFEED,
    });
    engine.on_rtcp_packet(&"sub".to_string(), &pli.serialize().unwrap());

    assert_eq!(requested.lock().unwrap().as_slice(), &[0xFEED]);
}

#[test]
fn test_participant_removal_cascades() {
    let (engine, recorder) = engine_with_recorder();

    engine
        .register_publisher(
            &"pub".to_string(),
            &"mic".to_string(),
            RtpStreamInfo::audio(42, 111, "opus"),
            None,
        )
        .unwrap();
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"mic".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    engine.remove_participant(&"pub".to_string());
    assert_eq!(engine.subscriptions().subscription_count(), 0);
    assert_eq!(engine.forwarder_stats().active_publishers, 0);

    // Packets for the removed SSRC are dropped, not forwarded
    engine.on_rtp_packet(42, &rtp_packet(42, 111, 100), dest());
    engine.process();
    assert!(recorder.sent.lock().unwrap().is_empty());
    assert_eq!(engine.forwarder_stats().packets_dropped, 1);
}

#[test]
fn test_pause_stops_forwarding_without_removal() {
    let (engine, recorder) = engine_with_recorder();

    engine
        .register_publisher(
            &"pub".to_string(),
            &"mic".to_string(),
            RtpStreamInfo::audio(7, 111, "opus"),
            None,
        )
        .unwrap();
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"mic".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    engine
        .set_paused(&"sub".to_string(), &"pub".to_string(), &"mic".to_string(), true)
        .unwrap();
    engine.on_rtp_packet(7, &rtp_packet(7, 111, 80), dest());
    engine.process();
    assert!(recorder.sent.lock().unwrap().is_empty());

    engine
        .set_paused(&"sub".to_string(), &"pub".to_string(), &"mic".to_string(), false)
        .unwrap();
    engine.on_rtp_packet(7, &rtp_packet(7, 111, 80), dest());
    engine.process();
    assert_eq!(recorder.sent.lock().unwrap().len(), 1);
}

#[test]
fn test_audio_outranks_video_in_the_pacer() {
    // A pacer with a bucket big enough for exactly one release burst shows
    // ordering: audio enqueued after video still leaves first
    let mut config = SfuEngineConfig::default();
    config.pacer.bucket_size_bytes = 1 << 20;
    let engine = SfuEngine::new(config);
    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let order_clone = Arc::clone(&order);
    engine.set_socket_sink(move |data: &[u8], _dest: SocketAddr| {
        order_clone.lock().unwrap().push(data[1] & 0x7F);
    });

    engine
        .register_publisher(
            &"pub".to_string(),
            &"cam".to_string(),
            RtpStreamInfo::video_layer(1, 96, "vp8", -1),
            None,
        )
        .unwrap();
    engine
        .register_publisher(
            &"pub".to_string(),
            &"mic".to_string(),
            RtpStreamInfo::audio(2, 111, "opus"),
            None,
        )
        .unwrap();
    engine
        .subscribe(
            &"sub".to_string(),
            &"pub".to_string(),
            &"cam".to_string(),
            dest(),
            0,
            -1,
        )
        .unwrap();

    engine.on_rtp_packet(1, &rtp_packet(1, 96, 400), dest());
    engine.on_rtp_packet(2, &rtp_packet(2, 111, 80), dest());
    engine.process();

    let order = order.lock().unwrap();
    assert_eq!(order.as_slice(), &[111, 96], "audio first despite later arrival");
}
