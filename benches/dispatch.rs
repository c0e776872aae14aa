//! Performance benchmarks for a3s-gateway
//!
//! Run with: cargo bench

use a3s_gateway::protocol::{Envelope, StreamEvent};
use a3s_gateway::{
    BackendOrchestrator, Event, EventBuilder, EventClient, EventProvider, Filter, GatewayConfig,
    Host, ProviderDescriptor, SessionOrigin, StoreProvider, StreamId,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn sample_event(i: u64) -> Event {
    EventBuilder::new(1, "alice", format!("note number {}", i))
        .tag(["p", "bob"])
        .tag(["t", "rust"])
        .created_at(1_700_000_000 + i)
        .build()
}

fn bench_event_identity(c: &mut Criterion) {
    c.bench_function("EventBuilder::build", |b| {
        b.iter(|| sample_event(7));
    });

    let event = sample_event(7);
    c.bench_function("Event::verify_id", |b| {
        b.iter(|| event.verify_id());
    });
}

fn bench_filter_matching(c: &mut Criterion) {
    let events: Vec<Event> = (0..1000).map(sample_event).collect();
    let filters = vec![
        Filter::new().kind(1).author("alice").since(1_700_000_500),
        Filter::new().tag('t', ["rust"]).search("number 9"),
    ];

    c.bench_function("Filter::matches (1000 events)", |b| {
        b.iter(|| {
            events
                .iter()
                .filter(|e| filters.iter().any(|f| f.matches(e)))
                .count()
        });
    });
}

fn bench_envelope_encoding(c: &mut Criterion) {
    let envelope = Envelope::Stream(StreamEvent::event(StreamId::generate(), sample_event(1)));

    c.bench_function("Envelope encode", |b| {
        b.iter(|| envelope.to_bytes().unwrap());
    });

    let bytes = envelope.to_bytes().unwrap();
    c.bench_function("Envelope decode", |b| {
        b.iter(|| Envelope::from_bytes(&bytes).unwrap());
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = GatewayConfig::default();

    let client = rt.block_on(async {
        let provider = Arc::new(StoreProvider::memory());
        provider.connect().await.unwrap();
        for i in 0..1000 {
            provider.add(&sample_event(i)).await.unwrap();
        }
        let orchestrator = Arc::new(BackendOrchestrator::new(config.clone()).unwrap());
        orchestrator
            .register(ProviderDescriptor::new("local", "Local", 1, provider))
            .unwrap();
        orchestrator.connect().await;
        let host = Arc::new(Host::new(orchestrator));
        EventClient::new(host.connect(SessionOrigin::Page), &config)
    });

    c.bench_function("client count (in-process)", |b| {
        b.to_async(&rt)
            .iter(|| async { client.count(&[Filter::new().kind(1)]).await.unwrap() });
    });

    c.bench_function("client filters limit 100 (in-process)", |b| {
        b.to_async(&rt).iter(|| async {
            let mut stream = client.filters(&[Filter::new().limit(100)]).await.unwrap();
            let mut n = 0;
            while stream.next().await.unwrap().is_some() {
                n += 1;
            }
            n
        });
    });
}

criterion_group!(
    benches,
    bench_event_identity,
    bench_filter_matching,
    bench_envelope_encoding,
    bench_round_trip,
);
criterion_main!(benches);
