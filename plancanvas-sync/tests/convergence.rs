//! A client that was offline converges on the ledger after resnapshot, no
//! matter how its pending work interleaved with other peers' edits and
//! deletes, or which of its sends reached the backend with the answer lost.

use std::collections::VecDeque;

use plancanvas_core::{
    AspectId, AspectPayload, CanvasAspect, CanvasSession, Mutation, MutationOp, SyncEvent,
};
use plancanvas_sync::CanvasLedger;
use proptest::prelude::*;
use uuid::Uuid;

fn note(label: impl Into<String>) -> AspectPayload {
    AspectPayload::note(0.0, 0.0, label)
}

fn aspects(ledger: &CanvasLedger) -> Vec<CanvasAspect> {
    match ledger.snapshot() {
        SyncEvent::Snapshot(aspects) => aspects,
        other => panic!("expected snapshot, got {other:?}"),
    }
}

fn sorted(mut aspects: Vec<CanvasAspect>) -> Vec<CanvasAspect> {
    aspects.sort_by(|a, b| a.id.cmp(&b.id));
    aspects
}

/// Another peer writing straight to the ledger.
struct Peer {
    id: Uuid,
    seq: u64,
}

impl Peer {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
        }
    }

    fn submit(&mut self, ledger: &mut CanvasLedger, correlation_id: AspectId, op: MutationOp) {
        self.seq += 1;
        let mutation = Mutation {
            correlation_id,
            seq: self.seq,
            op,
        };
        ledger.apply(self.id, &mutation);
    }

    fn create(&mut self, ledger: &mut CanvasLedger, label: &str) {
        let tentative = AspectId::new(format!("tmp-{}-{}", self.id, self.seq + 1));
        self.submit(ledger, tentative, MutationOp::Create { payload: note(label) });
    }

    fn update(&mut self, ledger: &mut CanvasLedger, aspect: &CanvasAspect, label: String) {
        let op = MutationOp::Update {
            id: aspect.id.clone(),
            base_revision: aspect.revision.unwrap_or_default(),
            payload: note(label),
        };
        self.submit(ledger, aspect.id.clone(), op);
    }

    fn delete(&mut self, ledger: &mut CanvasLedger, id: &AspectId) {
        self.submit(ledger, id.clone(), MutationOp::Delete { id: id.clone() });
    }
}

/// Reconnect: resnapshot, then answer every republished mutation until the
/// session has nothing left to send.
fn reconnect(session: &mut CanvasSession, ledger: &mut CanvasLedger, peer_id: Uuid) {
    let mut queue: VecDeque<Mutation> = session.apply(ledger.snapshot()).outgoing.into();
    let mut answered = 0;
    while let Some(mutation) = queue.pop_front() {
        answered += 1;
        assert!(answered < 1_000, "republication does not settle");
        let reply = ledger.apply(peer_id, &mutation).reply;
        queue.extend(session.apply(reply).outgoing);
    }
}

fn assert_converged(session: &CanvasSession, ledger: &CanvasLedger) {
    let client: Vec<CanvasAspect> = session.store().iter().cloned().collect();
    assert_eq!(sorted(client), sorted(aspects(ledger)));
    assert!(session.pending().is_empty());
    assert!(session.outstanding().is_empty());
}

#[test]
fn test_offline_update_of_aspect_deleted_elsewhere() {
    let mut ledger = CanvasLedger::new(Uuid::new_v4());
    let alice = Uuid::new_v4();
    let mut bob = Peer::new();
    bob.create(&mut ledger, "shared");

    let mut session = CanvasSession::new(ledger.canvas_id());
    session.apply(ledger.snapshot());
    let id = AspectId::from("c-1");
    assert!(session.update(&id, note("offline edit")).unwrap().is_some());

    bob.delete(&mut ledger, &id);
    reconnect(&mut session, &mut ledger, alice);

    assert_converged(&session, &ledger);
    assert!(session.store().is_empty());
    // No ghost left behind for later edits.
    assert!(session.update(&id, note("again")).is_err());
}

#[test]
fn test_unacked_create_deleted_elsewhere() {
    let mut ledger = CanvasLedger::new(Uuid::new_v4());
    let alice = Uuid::new_v4();
    let mut bob = Peer::new();

    let mut session = CanvasSession::new(ledger.canvas_id());
    session.apply(ledger.snapshot());
    let (tentative, create) = session.create(note("mine"));
    // Applied, but the Ack never arrived.
    ledger.apply(alice, &create);

    bob.delete(&mut ledger, &AspectId::from("c-1"));
    reconnect(&mut session, &mut ledger, alice);

    assert_converged(&session, &ledger);
    assert!(!session.store().contains(&tentative));
    assert!(!session.store().contains(&"c-1".into()));
}

#[derive(Debug, Clone)]
enum Step {
    /// Offline edit of the `pick`-th visible aspect. `delivered` sends reach
    /// the backend but their answer is lost.
    LocalUpdate { pick: usize, delivered: bool },
    LocalCreate { delivered: bool },
    LocalDelete { pick: usize, delivered: bool },
    RemoteUpdate { pick: usize },
    RemoteDelete { pick: usize },
    RemoteCreate,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (any::<usize>(), any::<bool>())
            .prop_map(|(pick, delivered)| Step::LocalUpdate { pick, delivered }),
        any::<bool>().prop_map(|delivered| Step::LocalCreate { delivered }),
        (any::<usize>(), any::<bool>())
            .prop_map(|(pick, delivered)| Step::LocalDelete { pick, delivered }),
        any::<usize>().prop_map(|pick| Step::RemoteUpdate { pick }),
        any::<usize>().prop_map(|pick| Step::RemoteDelete { pick }),
        Just(Step::RemoteCreate),
    ]
}

fn pick_local(session: &CanvasSession, pick: usize) -> Option<AspectId> {
    let ids = session.store().ids();
    (!ids.is_empty()).then(|| ids[pick % ids.len()].clone())
}

fn pick_remote(ledger: &CanvasLedger, pick: usize) -> Option<CanvasAspect> {
    let all = aspects(ledger);
    (!all.is_empty()).then(|| all[pick % all.len()].clone())
}

proptest! {
    #[test]
    fn test_client_converges_after_reconnect(
        seeded in 0usize..4,
        steps in prop::collection::vec(step(), 0..24),
    ) {
        let mut ledger = CanvasLedger::new(Uuid::new_v4());
        let alice = Uuid::new_v4();
        let mut bob = Peer::new();
        for i in 0..seeded {
            bob.create(&mut ledger, &format!("seed-{i}"));
        }

        let mut session = CanvasSession::new(ledger.canvas_id());
        session.apply(ledger.snapshot());

        for (n, step) in steps.iter().enumerate() {
            match *step {
                Step::LocalUpdate { pick, delivered } => {
                    let Some(id) = pick_local(&session, pick) else { continue };
                    if let Ok(Some(m)) = session.update(&id, note(format!("alice-{n}"))) {
                        if delivered {
                            ledger.apply(alice, &m);
                        }
                    }
                }
                Step::LocalCreate { delivered } => {
                    let (_, m) = session.create(note(format!("alice-{n}")));
                    if delivered {
                        ledger.apply(alice, &m);
                    }
                }
                Step::LocalDelete { pick, delivered } => {
                    let Some(id) = pick_local(&session, pick) else { continue };
                    if let Ok(m) = session.delete(&id) {
                        if delivered {
                            ledger.apply(alice, &m);
                        }
                    }
                }
                Step::RemoteUpdate { pick } => {
                    let Some(aspect) = pick_remote(&ledger, pick) else { continue };
                    bob.update(&mut ledger, &aspect, format!("bob-{n}"));
                }
                Step::RemoteDelete { pick } => {
                    let Some(aspect) = pick_remote(&ledger, pick) else { continue };
                    bob.delete(&mut ledger, &aspect.id);
                }
                Step::RemoteCreate => bob.create(&mut ledger, &format!("bob-{n}")),
            }
        }

        reconnect(&mut session, &mut ledger, alice);

        let client: Vec<CanvasAspect> = session.store().iter().cloned().collect();
        prop_assert_eq!(sorted(client), sorted(aspects(&ledger)));
        prop_assert!(session.pending().is_empty());
        prop_assert!(session.outstanding().is_empty());
    }
}
