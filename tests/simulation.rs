use std::collections::HashSet;

use pow_network_sim::prelude::*;

fn run(builder: SimulationBuilder) -> Vec<SimulationOutput> {
    builder
        .peers(8)
        .txn_interval(100.0)
        .block_interval(400.0)
        .initial_coins(100.0)
        .max_blocks(Some(15))
        .build()
        .expect("valid simulation build")
        .run_all()
        .expect("simulation runs")
        .data()
}

#[test]
fn honest_network_keeps_every_view_consistent() {
    let outputs = run(SimulationBuilder::new().seed(2024));
    assert_eq!(outputs.len(), 1);
    let output = &outputs[0];

    assert_eq!(output.blocks_broadcast, 15);
    assert!(output.txns_created > 0);
    assert!(output.longest_chain_length() > 0);

    let total_power: f64 = output.power_values.iter().sum();
    assert!((total_power - 1.0).abs() < 1e-9);

    for peer in &output.peers {
        let chain = peer.state().chain();
        let genesis = chain.genesis();
        assert_eq!(chain.chain_length(genesis), Some(1));

        for data in chain.iter() {
            // Balances never go negative, and coins are only created by
            // coinbase transactions.
            assert!(data.balances.values().all(|&b| b >= 0.0));
            let total: f64 = data.balances.values().sum();
            let coinbases = (data.chain_length - 1) as f64;
            assert!((total - (800.0 + 50.0 * coinbases)).abs() < 1e-6);

            // No transaction appears twice along a path.
            let path = chain.ancestors_of(data.block.id);
            let mut seen = HashSet::new();
            for id in &path {
                for txn in &chain[id].block.txns {
                    assert!(seen.insert(txn.id), "{} included twice", txn.id);
                }
            }
            assert_eq!(path.len() as u64, data.chain_length);
        }

        // The public leaf has maximal length among accepted blocks.
        let max = chain.iter().map(|data| data.chain_length).max();
        assert_eq!(Some(peer.state().public_length()), max);
    }

    let revenue: f64 = (0..8).map(|i| output.revenue_of(PeerId::from(i))).sum();
    assert!((revenue - 1.0).abs() < 1e-9);
}

#[test]
fn selfish_peer_withholds_and_releases() {
    let outputs = run(
        SimulationBuilder::new()
            .add_miner(Selfish::new())
            .peer_power(PeerId::from(0), 0.45)
            .repeat_all(6)
            .seed(7),
    );
    let selfish_id = PeerId::from(0);
    let mut withheld_runs = 0;

    for output in &outputs {
        let selfish = &output.peers[0];
        assert_eq!(selfish.miner().name(), "Selfish");
        assert!((output.power_values[0] - 0.45).abs() < 1e-12);

        let mined: HashSet<_> =
            selfish.blocks_mined().iter().copied().collect();
        assert!(!mined.is_empty(), "selfish peer mined nothing");
        for id in &mined {
            if let Some(data) = selfish.state().chain().get(*id) {
                assert!(data.block.private);
            }
        }

        // Every block is released at most once, and only blocks the peer
        // actually mined are released.
        let published = output.blocks_published_by(selfish_id);
        let released: HashSet<_> = published.iter().copied().collect();
        assert_eq!(released.len(), published.len());
        assert!(released.is_subset(&mined));

        // Honest peers only ever learn about released blocks.
        for peer in &output.peers[1..] {
            let chain = peer.state().chain();
            for data in chain.iter() {
                if data.block.miner == Some(selfish_id) {
                    assert!(released.contains(&data.block.id));
                }
            }
            for id in mined.difference(&released) {
                assert!(!chain.contains(*id) && !chain.is_pending(*id));
            }
        }

        if released.len() < mined.len() {
            withheld_runs += 1;
        }
    }

    // Blocks still withheld at the end, or discarded after losing a race,
    // never leave the selfish peer.
    assert!(withheld_runs > 0, "selfish peer never withheld a block");
}

#[test]
fn seeded_groups_are_reproducible() {
    let build = || {
        SimulationBuilder::new()
            .add_miner(Selfish::new())
            .peer_power(PeerId::from(0), 0.3)
            .repeat_all(2)
            .seed(11)
    };
    let a = run(build());
    let b = run(build());

    assert_eq!(a.len(), 2);
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.seed, y.seed);
        assert_eq!(x.longest_chain, y.longest_chain);
        assert_eq!(x.end_time, y.end_time);
    }
    assert_ne!(a[0].seed, a[1].seed);
}

#[test]
fn time_limit_stops_the_run() {
    let outputs = SimulationBuilder::new()
        .peers(5)
        .txn_interval(50.0)
        .max_blocks(None)
        .max_time(Some(2_000.0))
        .seed(3)
        .build()
        .unwrap()
        .run_all()
        .unwrap()
        .data();

    let end = outputs[0].end_time.as_millis();
    assert!(end > 2_000.0);
    assert!(end < 2_000.0 + 1_000.0);
}
