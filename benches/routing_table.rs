//! Micro-benchmarks for RoutingTable operations: add, closest, and remove
//! at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use std::time::Instant;

use overlay_dht::{NodeId, PeerDescriptor, RoutingTable};

fn main() {
    println!("routing_table\n");

    bench_add();
    bench_closest();
    bench_remove();
}

fn peers(count: usize) -> Vec<PeerDescriptor> {
    (0..count).map(|_| PeerDescriptor::random()).collect()
}

fn bench_add() {
    println!("add");

    // Pre-generate peers outside the timed section
    let fresh = peers(1000);

    for prefilled in [0, 100, 400] {
        let mut table = RoutingTable::new(NodeId::random());
        for peer in peers(prefilled) {
            table.add(peer);
        }

        let start = Instant::now();
        for peer in fresh.iter().cloned() {
            table.add(peer);
        }
        let per_op = start.elapsed().as_nanos() / fresh.len() as u128;
        println!(
            "{prefilled:>3} prefilled: {per_op}ns/op (final size: {})",
            table.size()
        );
    }

    println!();
}

fn bench_closest() {
    println!("closest");

    let targets: Vec<_> = (0..1000).map(|_| NodeId::random()).collect();

    for size in [50, 100, 200, 400] {
        let mut table = RoutingTable::new(NodeId::random());
        for peer in peers(size) {
            table.add(peer);
        }

        let start = Instant::now();
        for target in &targets {
            let _ = table.closest(target);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} peers: {per_op}ns/op");
    }

    println!();
}

fn bench_remove() {
    println!("remove");

    let mut table = RoutingTable::new(NodeId::random());

    let mut ids = Vec::new();
    for peer in peers(200) {
        ids.push(*peer.node_id());
        table.add(peer);
    }

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.remove(id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} removals)");
    println!();
}
