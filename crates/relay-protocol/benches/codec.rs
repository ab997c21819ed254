//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, IceCandidate, SignalingEnvelope, TransportMessage, WebRtcOffer};

fn offer_message() -> TransportMessage {
    let envelope = SignalingEnvelope::Offer(WebRtcOffer {
        sdp: "v=0\r\n".repeat(64),
        player_id: "player-1".into(),
        game_id: "game-1".into(),
        session_id: "session-1".into(),
    });
    TransportMessage::signal("player-1", "game-1", &envelope).unwrap()
}

fn bench_decode_message(c: &mut Criterion) {
    let encoded = codec::encode(&offer_message()).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("transport_message", |b| {
        b.iter(|| codec::decode_message(black_box(encoded.as_bytes())))
    });
    group.finish();
}

fn bench_decode_signal(c: &mut Criterion) {
    let envelope = SignalingEnvelope::Candidate(IceCandidate {
        candidate: "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx".into(),
        player_id: "player-1".into(),
        game_id: "game-1".into(),
        session_id: "session-1".into(),
    });
    let encoded = codec::encode(&envelope).unwrap();

    c.bench_function("decode_candidate", |b| {
        b.iter(|| codec::decode_signal(black_box(encoded.as_bytes())).unwrap())
    });
}

fn bench_partition_key(c: &mut Criterion) {
    let message = offer_message();

    c.bench_function("partition_key", |b| b.iter(|| black_box(&message).partition_key()));
}

criterion_group!(
    benches,
    bench_decode_message,
    bench_decode_signal,
    bench_partition_key
);
criterion_main!(benches);
