//! Offer matching.
//!
//! [`match_offers`] is a pure function: given an offer batch and a view of
//! the registry it decides which offers to accept and why the others are
//! declined. The registry applies the decision under its lock, creating a
//! `Requested` member for every accepted offer before the offer handle is
//! used.

use std::collections::HashSet;
use std::time::Duration;

use seedkeeper_id::{HostId, OfferId};
use seedkeeper_reconcile::LaunchGate;
use serde::{Deserialize, Serialize};

/// An inclusive range of ports offered by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        if self.end < self.begin {
            0
        } else {
            usize::from(self.end - self.begin) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resources carried by an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    pub ports: Vec<PortRange>,
}

impl Resources {
    fn port_count(&self) -> usize {
        self.ports.iter().map(PortRange::len).sum()
    }

    /// Take the first `count` offered ports, in range order.
    fn take_ports(&self, count: usize) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|r| !r.is_empty())
            .flat_map(|r| r.begin..=r.end)
            .take(count)
            .collect()
    }
}

/// A resource offer from the cluster manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub host: HostId,
    pub hostname: String,
    pub resources: Resources,
}

/// Resources every member needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberRequirements {
    pub cpus: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    /// Client, peer and executor ports.
    pub ports: usize,
}

impl Default for MemberRequirements {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem_mb: 256.0,
            disk_mb: 1024.0,
            ports: 3,
        }
    }
}

impl MemberRequirements {
    pub fn satisfied_by(&self, resources: &Resources) -> bool {
        resources.cpus >= self.cpus
            && resources.mem_mb >= self.mem_mb
            && resources.disk_mb >= self.disk_mb
            && resources.port_count() >= self.ports
    }
}

/// Ports assigned to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPorts {
    pub client: u16,
    pub peer: u16,
    pub executor: u16,
}

impl MemberPorts {
    fn from_slice(ports: &[u16]) -> Option<Self> {
        match ports {
            [client, peer, executor, ..] => Some(Self {
                client: *client,
                peer: *peer,
                executor: *executor,
            }),
            _ => None,
        }
    }
}

/// Why an offer was declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// Enough members are already active.
    ClusterFull,
    /// Another launch has not finished converging yet.
    LaunchInFlight,
    /// The host already runs a member of this generation.
    HostOccupied,
    /// The offer is smaller than one member.
    InsufficientResources,
    /// The scheduler is not accepting offers.
    ShuttingDown,
}

impl DeclineReason {
    /// How long the cluster manager should hold back this host's resources.
    pub fn refuse_for(&self) -> Duration {
        match self {
            Self::ClusterFull | Self::HostOccupied => Duration::from_secs(60),
            Self::InsufficientResources => Duration::from_secs(30),
            Self::LaunchInFlight | Self::ShuttingDown => Duration::from_secs(1),
        }
    }
}

impl std::fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClusterFull => "cluster_full",
            Self::LaunchInFlight => "launch_in_flight",
            Self::HostOccupied => "host_occupied",
            Self::InsufficientResources => "insufficient_resources",
            Self::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Registry state the matcher decides against.
#[derive(Debug, Clone)]
pub struct MatchView<'a> {
    /// Desired member count (1 while a reseed seed is pending).
    pub desired: usize,
    /// Members in `Requested`, `Launching` or `Running`.
    pub active: usize,
    /// Members in `Requested` or `Launching`.
    pub in_flight: usize,
    /// The launcher is still inside its convergence delay.
    pub launcher_busy: bool,
    /// Hosts holding a non-removed member of the current generation.
    pub occupied_hosts: &'a HashSet<HostId>,
    /// Offers already owned by a pending member.
    pub claimed_offers: &'a HashSet<OfferId>,
    pub one_per_host: bool,
    pub requirements: &'a MemberRequirements,
    pub gate: &'a LaunchGate,
}

/// An accepted offer with the ports chosen for the new member.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedOffer {
    pub offer: Offer,
    pub ports: MemberPorts,
}

/// A declined offer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclinedOffer {
    pub offer_id: OfferId,
    pub host: HostId,
    pub reason: DeclineReason,
}

/// The partition of an offer batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub accepted: Vec<AcceptedOffer>,
    pub declined: Vec<DeclinedOffer>,
    /// Re-delivered offers whose handle is already owned by a pending member.
    pub redelivered: Vec<OfferId>,
}

/// Decide an offer batch. First sufficient offer wins.
pub fn match_offers(offers: Vec<Offer>, view: &MatchView<'_>) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let admissible = view
        .gate
        .admissible(view.desired, view.active, view.in_flight, view.launcher_busy);
    let mut taken_hosts: HashSet<HostId> = HashSet::new();
    let mut seen_offers: HashSet<OfferId> = HashSet::new();

    for offer in offers {
        if view.claimed_offers.contains(&offer.id) || !seen_offers.insert(offer.id.clone()) {
            outcome.redelivered.push(offer.id);
            continue;
        }

        let host_taken = view.one_per_host
            && (view.occupied_hosts.contains(&offer.host) || taken_hosts.contains(&offer.host));

        let reason = if outcome.accepted.len() >= admissible {
            Some(if view.active + outcome.accepted.len() >= view.desired {
                DeclineReason::ClusterFull
            } else {
                DeclineReason::LaunchInFlight
            })
        } else if host_taken {
            Some(DeclineReason::HostOccupied)
        } else if !view.requirements.satisfied_by(&offer.resources) {
            Some(DeclineReason::InsufficientResources)
        } else {
            None
        };

        let ports = offer
            .resources
            .take_ports(view.requirements.ports.max(3));
        match (reason, MemberPorts::from_slice(&ports)) {
            (None, Some(ports)) => {
                taken_hosts.insert(offer.host.clone());
                outcome.accepted.push(AcceptedOffer { offer, ports });
            }
            (reason, _) => outcome.declined.push(DeclinedOffer {
                offer_id: offer.id,
                host: offer.host,
                reason: reason.unwrap_or(DeclineReason::InsufficientResources),
            }),
        }
    }

    outcome
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    pub(crate) fn offer(id: &str, host: &str) -> Offer {
        Offer {
            id: OfferId::new(id),
            host: HostId::new(host),
            hostname: format!("{host}.cluster.local"),
            resources: Resources {
                cpus: 4.0,
                mem_mb: 4096.0,
                disk_mb: 8192.0,
                ports: vec![PortRange {
                    begin: 31000,
                    end: 31099,
                }],
            },
        }
    }

    struct Fixture {
        occupied: HashSet<HostId>,
        claimed: HashSet<OfferId>,
        requirements: MemberRequirements,
        gate: LaunchGate,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                occupied: HashSet::new(),
                claimed: HashSet::new(),
                requirements: MemberRequirements::default(),
                gate: LaunchGate::default(),
            }
        }

        fn view(&self, desired: usize, active: usize) -> MatchView<'_> {
            MatchView {
                desired,
                active,
                in_flight: 0,
                launcher_busy: false,
                occupied_hosts: &self.occupied,
                claimed_offers: &self.claimed,
                one_per_host: true,
                requirements: &self.requirements,
                gate: &self.gate,
            }
        }
    }

    #[test]
    fn test_first_sufficient_offer_wins() {
        let fx = Fixture::new();
        let mut small = offer("o1", "h1");
        small.resources.mem_mb = 64.0;
        let offers = vec![small, offer("o2", "h2"), offer("o3", "h3")];

        let outcome = match_offers(offers, &fx.view(5, 0));

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].offer.id, OfferId::new("o2"));
        assert_eq!(
            outcome.accepted[0].ports,
            MemberPorts {
                client: 31000,
                peer: 31001,
                executor: 31002
            }
        );
        let reasons: Vec<_> = outcome.declined.iter().map(|d| d.reason).collect();
        assert_eq!(
            reasons,
            vec![
                DeclineReason::InsufficientResources,
                DeclineReason::LaunchInFlight
            ]
        );
    }

    #[test]
    fn test_occupied_host_declined() {
        let mut fx = Fixture::new();
        fx.occupied.insert(HostId::new("h1"));

        let outcome = match_offers(vec![offer("o1", "h1"), offer("o2", "h2")], &fx.view(3, 1));

        assert_eq!(outcome.accepted[0].offer.host, HostId::new("h2"));
        assert_eq!(outcome.declined[0].reason, DeclineReason::HostOccupied);
    }

    #[test]
    fn test_colocation_allowed_when_disabled() {
        let mut fx = Fixture::new();
        fx.occupied.insert(HostId::new("h1"));
        let mut view = fx.view(3, 1);
        view.one_per_host = false;

        let outcome = match_offers(vec![offer("o1", "h1")], &view);
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn test_full_cluster_declines_everything() {
        let fx = Fixture::new();
        let outcome = match_offers(vec![offer("o1", "h1"), offer("o2", "h2")], &fx.view(3, 3));
        assert!(outcome.accepted.is_empty());
        assert!(outcome
            .declined
            .iter()
            .all(|d| d.reason == DeclineReason::ClusterFull));
    }

    #[test]
    fn test_redelivered_offer_is_neither_accepted_nor_declined() {
        let mut fx = Fixture::new();
        fx.claimed.insert(OfferId::new("o1"));

        let outcome = match_offers(vec![offer("o1", "h1"), offer("o1", "h1")], &fx.view(3, 1));

        assert!(outcome.accepted.is_empty());
        assert!(outcome.declined.is_empty());
        assert_eq!(outcome.redelivered.len(), 2);
    }

    #[test]
    fn test_too_few_ports() {
        let fx = Fixture::new();
        let mut o = offer("o1", "h1");
        o.resources.ports = vec![
            PortRange {
                begin: 31000,
                end: 31000,
            },
            PortRange {
                begin: 32000,
                end: 32000,
            },
        ];
        let outcome = match_offers(vec![o], &fx.view(3, 0));
        assert_eq!(
            outcome.declined[0].reason,
            DeclineReason::InsufficientResources
        );
    }

    #[test]
    fn test_ports_span_ranges() {
        let fx = Fixture::new();
        let mut o = offer("o1", "h1");
        o.resources.ports = vec![
            PortRange {
                begin: 31000,
                end: 31001,
            },
            PortRange {
                begin: 32000,
                end: 32005,
            },
        ];
        let outcome = match_offers(vec![o], &fx.view(3, 0));
        assert_eq!(outcome.accepted[0].ports.executor, 32000);
    }

    #[rstest]
    #[case(DeclineReason::ClusterFull, 60)]
    #[case(DeclineReason::HostOccupied, 60)]
    #[case(DeclineReason::InsufficientResources, 30)]
    #[case(DeclineReason::LaunchInFlight, 1)]
    #[case(DeclineReason::ShuttingDown, 1)]
    fn test_refuse_durations(#[case] reason: DeclineReason, #[case] secs: u64) {
        assert_eq!(reason.refuse_for(), Duration::from_secs(secs));
    }

    proptest! {
        #[test]
        fn prop_accepts_bounded_by_gap_and_hosts_distinct(
            desired in 1usize..8,
            active in 0usize..8,
            hosts in proptest::collection::vec(0u8..6, 0..12),
        ) {
            let fx = Fixture::new();
            let offers: Vec<Offer> = hosts
                .iter()
                .enumerate()
                .map(|(i, h)| offer(&format!("o{i}"), &format!("h{h}")))
                .collect();
            let total = offers.len();

            let outcome = match_offers(offers, &fx.view(desired, active));

            prop_assert!(outcome.accepted.len() <= desired.saturating_sub(active));
            prop_assert_eq!(outcome.accepted.len() + outcome.declined.len(), total);
            let distinct: HashSet<_> = outcome.accepted.iter().map(|a| a.offer.host.clone()).collect();
            prop_assert_eq!(distinct.len(), outcome.accepted.len());
        }
    }
}
