use virtraft::{
    Command, ConnectStatus, Engine, SimConfig, SimError, Simulation, StatusChange, ToggleOutcome,
};

const ELECT_FIRST: &[u8] = b"perid0perid0recv1recv2recv0";

fn simulation(nodes: usize) -> anyhow::Result<Simulation> {
    Ok(Simulation::builder().seed(3).nodes(nodes).build()?)
}

#[test]
fn script_elects_first_replica() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    let executed = sim.run_script(ELECT_FIRST)?;

    assert_eq!(executed, 5);
    assert_eq!(sim.leader(), Some(0));
    assert_eq!(sim.stats().leadership_changes, 1);
    Ok(())
}

#[test]
fn script_replicates_entries() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    sim.run_script(ELECT_FIRST)?;
    sim.run_script(&b"recv1 recv2 recv0 recv1 recv2 recv0 recv1 recv2 recv0\0"[..])?;

    let leader = sim.engine(0).map(|e| e.commit_index()).unwrap_or(0);
    assert!(leader >= 1);
    assert!(sim.stats().entries_applied >= leader);
    assert_eq!(sim.ledger().highest(), sim.stats().max_commit_index);
    Ok(())
}

#[test]
fn toggling_leader_changes_nothing() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    sim.run_script(ELECT_FIRST)?;

    let before = sim.diagnostics();
    let proposed = sim.stats().config_changes_proposed;
    sim.run_script(&b"togglmem0"[..])?;

    assert_eq!(sim.diagnostics(), before);
    assert_eq!(sim.stats().config_changes_proposed, proposed);
    assert_eq!(sim.toggle_membership(0)?, ToggleOutcome::IsLeader);
    Ok(())
}

#[test]
fn toggling_without_leader_is_harmless() -> anyhow::Result<()> {
    let mut sim = simulation(5)?;
    sim.run_script(&b"togglmem0togglmem3"[..])?;

    assert!(sim
        .nodes()
        .iter()
        .all(|n| n.status() == ConnectStatus::Connected));
    Ok(())
}

#[test]
fn dropped_messages_never_arrive() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    sim.run_script(&b"perid0perid0drop1drop2"[..])?;

    assert_eq!(sim.stats().network.scripted_drops, 2);
    assert!(sim.nodes().iter().all(|n| n.inbox.is_empty()));
    assert_eq!(sim.leader(), None);
    Ok(())
}

#[test]
fn partition_discards_inbound() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    sim.run_script(&b"part1part2perid0perid0"[..])?;

    assert!(sim.node(1).map_or(false, |n| n.partitioned));
    assert!(sim.nodes().iter().all(|n| n.inbox.is_empty()));
    assert!(sim.stats().network.messages_partitioned >= 2);
    Ok(())
}

#[test]
fn replay_is_deterministic() -> anyhow::Result<()> {
    let script = b"perid1perid1recv0recv2recv1 entry entry part2 entry togglmem2 entry entry";

    let mut a = Simulation::builder()
        .config(SimConfig::new(3, 21).with_membership_rate(10))
        .build()?;
    let mut b = Simulation::builder()
        .config(SimConfig::new(3, 21).with_membership_rate(10))
        .build()?;
    a.run_script(&script[..])?;
    b.run_script(&script[..])?;

    assert_eq!(a.stats(), b.stats());
    assert_eq!(a.diagnostics(), b.diagnostics());
    Ok(())
}

#[test]
fn malformed_script_stops() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    let err = sim.run_script(&b"perid0 perid0 bogus recv1"[..]).unwrap_err();

    assert!(matches!(err, SimError::MalformedCommand { offset: 14, byte: b'b' }));
    assert!(!sim.is_halted());
    Ok(())
}

#[test]
fn unknown_replica_stops() -> anyhow::Result<()> {
    let mut sim = simulation(3)?;
    let err = sim.run_script(&b"recv7"[..]).unwrap_err();

    assert!(matches!(err, SimError::UnknownReplica { slot: 7, nodes: 3 }));
    Ok(())
}

/// Runs `rounds` of a 10 ms clock step and an inbox poll over `slots` until `done` holds.
fn settle<F>(sim: &mut Simulation, slots: &[usize], rounds: usize, done: F) -> anyhow::Result<bool>
where
    F: Fn(&Simulation) -> bool,
{
    for _ in 0..rounds {
        for &slot in slots {
            sim.periodic(slot, 10)?;
        }
        for &slot in slots {
            sim.poll(slot)?;
        }
        if done(sim) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn committed_in_own_term(sim: &Simulation, slot: usize) -> bool {
    sim.engine(slot).map_or(false, |engine| {
        engine
            .entry_at(engine.commit_index())
            .map_or(false, |entry| entry.term == engine.current_term())
    })
}

#[test]
fn leave_lost_with_partitioned_leader_rolls_back() -> anyhow::Result<()> {
    let mut sim = simulation(5)?;
    sim.run_script(&b"perid0perid0recv1recv2recv3recv4recv0"[..])?;
    assert_eq!(sim.leader(), Some(0));

    for _ in 0..10 {
        if committed_in_own_term(&sim, 0) {
            break;
        }
        sim.run_script(&b"recv1recv2recv3recv4recv0"[..])?;
    }
    assert!(committed_in_own_term(&sim, 0));

    // the demote reaches no follower before the leader is cut off
    assert_eq!(sim.toggle_membership(4)?, ToggleOutcome::Leaving(4));
    assert_eq!(sim.node(4).map(|n| n.status()), Some(ConnectStatus::Disconnecting));
    assert!(sim.toggle_partition(0)?);
    for slot in 1..5 {
        while sim.drop_one(slot)?.is_some() {}
    }

    let others = [1, 2, 3, 4];
    let elected = settle(&mut sim, &others, 200, |sim| {
        sim.leader().map_or(false, |leader| leader != 0)
    })?;
    assert!(elected, "no leader among the reachable replicas");
    let leader = sim.leader().unwrap_or(0);

    for _ in 0..50 {
        if committed_in_own_term(&sim, leader) {
            break;
        }
        sim.propose_client_entry()?;
        for &slot in &others {
            sim.poll(slot)?;
        }
    }
    assert!(committed_in_own_term(&sim, leader));

    // the demote only lives on the cut-off replica, the leave is undone
    sim.execute(Command::Periodic(leader))?;
    let leaving = sim.node(4).expect("slot 4 exists");
    assert_eq!(leaving.status(), ConnectStatus::Connected);
    assert!(leaving.voting);
    assert!(leaving.history().iter().all(StatusChange::is_legal));

    let commit = sim.engine(leader).map_or(0, |e| e.commit_index());
    assert!(!sim.toggle_partition(0)?);
    sim.run(300)?;

    let new_leader = sim.leader().expect("a leader after healing");
    let reference = sim.engine(new_leader).and_then(|e| e.entry_at(commit)).cloned();
    assert!(reference.is_some());
    for slot in 0..5 {
        assert_eq!(sim.engine(slot).and_then(|e| e.entry_at(commit)).cloned(), reference);
    }
    assert!(sim.nodes().iter().all(|n| n.status() == ConnectStatus::Connected));
    Ok(())
}
