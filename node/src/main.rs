//! Run a simulated network of avalanche nodes finalizing a shared chain.
//!
//! Every participant stakes one output of a common genesis block, connects to every other
//! participant over an in-memory network and polls the others about the blocks it is fed. The
//! driver mines a few blocks, hands each of them to every participant, and waits until the
//! network has finalized the tip.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin avalanche-node -- --participants 12 --blocks 3
//! ```
//!
//! Pass `--data-dir` to have the first participant persist its peers (`avapeers.dat`) on
//! shutdown and reload them on the next run, and `--metrics` to print the collected metrics.

use avalanche::{
    chain::{Block, Chainstate, Transaction, TxOut},
    engine::{self, Actor, Mailbox},
    node::Node,
    p2p::simulated::{self, Network},
    persist,
    processor::Config,
    proof::ProofBuilder,
    rpc,
    types::{Amount, BlockHash, NodeId, OutPoint, COIN},
    voting::VOTE_WINDOW,
};
use avalanche_cryptography::{Ed25519, PrivateKey};
use bytes::Bytes;
use clap::{value_parser, Arg, ArgAction, Command};
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    path::PathBuf,
    str::FromStr,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::time::{sleep, timeout};
use tracing::{info, warn, Level};

/// Amount staked by every participant.
const STAKE: Amount = 100_000_000 * COIN;

/// Seed offset separating master keys from staking keys.
const MASTER_SEED_OFFSET: u64 = 1_000;

struct Participant {
    id: NodeId,
    node: Node<Ed25519>,
}

/// A genesis block funding one stake per participant, and the proofs staking them.
fn participants(count: u64, cfg: &Config, registry: &mut Registry) -> (Block, Vec<Participant>) {
    let stakers: Vec<PrivateKey> = (0..count).map(PrivateKey::from_seed).collect();
    let outputs = stakers
        .iter()
        .map(|key| TxOut {
            amount: STAKE,
            owner: key.public_key(),
        })
        .collect();
    let coinbase = Transaction::coinbase(0, outputs);
    let genesis = Block::new(
        BlockHash::default(),
        0,
        now(),
        1,
        0,
        vec![coinbase.clone()],
    );

    let participants = stakers
        .into_iter()
        .enumerate()
        .map(|(i, staker)| {
            let master = PrivateKey::from_seed(MASTER_SEED_OFFSET + i as u64);
            let mut builder = ProofBuilder::new(0, 0, master.clone(), Bytes::new());
            builder.add_utxo(
                OutPoint::new(coinbase.id(), i as u32),
                STAKE,
                0,
                true,
                staker,
            );
            let cfg = Config {
                proof: Some(builder.build()),
                master_key: Some(master),
                ..cfg.clone()
            };
            let node = Node::new(
                cfg,
                genesis.clone(),
                Ed25519,
                registry.sub_registry_with_prefix(format!("node_{i}")),
                StdRng::seed_from_u64(i as u64),
            )
            .expect("invalid node configuration");
            Participant {
                id: i as NodeId + 1,
                node,
            }
        })
        .collect();
    (genesis, participants)
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Poll `mailbox` until `hash` is final.
async fn wait_final(mailbox: &mut Mailbox<Ed25519>, hash: BlockHash) -> Result<(), engine::Error> {
    loop {
        if mailbox.is_final_block(hash).await? == Some(true) {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() {
    // Parse arguments
    let matches = Command::new("avalanche-node")
        .about("finalize a shared chain with a simulated network of avalanche nodes")
        .arg(
            Arg::new("participants")
                .long("participants")
                .default_value("12")
                .value_parser(value_parser!(u64).range(VOTE_WINDOW as u64 + 2..))
                .help("Number of staking nodes (each needs more peers than the vote window)"),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .default_value("3")
                .value_parser(value_parser!(u32))
                .help("Number of blocks to mine"),
        )
        .arg(
            Arg::new("avacooldown")
                .long("avacooldown")
                .default_value("100")
                .value_parser(value_parser!(u64))
                .help("Minimum delay between two polls of the same node, in milliseconds"),
        )
        .arg(
            Arg::new("avaminquorumconnectedstakeratio")
                .long("avaminquorumconnectedstakeratio")
                .default_value("0.8")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("avaminavaproofsnodecount")
                .long("avaminavaproofsnodecount")
                .value_parser(value_parser!(usize))
                .help("Defaults to the number of other participants, capped at 8"),
        )
        .arg(
            Arg::new("avalanchepreconsensus")
                .long("avalanchepreconsensus")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("avalanchestakingrewards")
                .long("avalanchestakingrewards")
                .action(ArgAction::SetTrue)
                .help("Select a staking reward winner for every tip"),
        )
        .arg(
            Arg::new("avalanchestakingpreconsensus")
                .long("avalanchestakingpreconsensus")
                .action(ArgAction::SetTrue)
                .requires("avalanchestakingrewards")
                .help("Poll stake contenders"),
        )
        .arg(
            Arg::new("maxaddrtosend")
                .long("maxaddrtosend")
                .default_value("100")
                .value_parser(value_parser!(usize))
                .help("Maximum number of addresses sent in reply to getavaaddr"),
        )
        .arg(Arg::new("data-dir").long("data-dir").value_parser(value_parser!(PathBuf)))
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value("60")
                .value_parser(value_parser!(u64))
                .help("Seconds to wait for each block to finalize"),
        )
        .arg(Arg::new("log-level").long("log-level").default_value("info"))
        .arg(Arg::new("metrics").long("metrics").action(ArgAction::SetTrue))
        .get_matches();

    // Create logger
    let level = matches
        .get_one::<String>("log-level")
        .map_or(Level::INFO, |level| {
            Level::from_str(level).expect("invalid log level")
        });
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure nodes
    let count = *matches.get_one::<u64>("participants").expect("missing participants");
    let others = (count - 1) as usize;
    let cfg = Config {
        min_quorum_connected_stake_ratio: *matches
            .get_one::<f64>("avaminquorumconnectedstakeratio")
            .expect("missing ratio"),
        min_avaproofs_node_count: matches
            .get_one::<usize>("avaminavaproofsnodecount")
            .copied()
            .unwrap_or(others.min(8)),
        min_quorum_node_count: VOTE_WINDOW + 1,
        stake_utxo_dust_threshold: STAKE,
        stake_utxo_confirmations: 1,
        cooldown: Duration::from_millis(
            *matches.get_one::<u64>("avacooldown").expect("missing cooldown"),
        ),
        preconsensus: matches.get_flag("avalanchepreconsensus"),
        staking_rewards: matches.get_flag("avalanchestakingrewards"),
        staking_preconsensus: matches.get_flag("avalanchestakingpreconsensus"),
        max_addr_to_send: *matches.get_one::<usize>("maxaddrtosend").expect("missing max addr"),
        ..Config::default()
    };
    let data_dir = matches.get_one::<PathBuf>("data-dir").cloned();
    if let Some(dir) = &data_dir {
        std::fs::create_dir_all(dir).expect("unable to create data directory");
    }
    let wait = Duration::from_secs(*matches.get_one::<u64>("timeout").expect("missing timeout"));

    // Start the network
    let mut registry = Registry::default();
    let network = Network::new(simulated::Config::default(), &mut registry);
    let (genesis, participants) = participants(count, &cfg, &mut registry);
    let ids: Vec<NodeId> = participants.iter().map(|participant| participant.id).collect();
    let mut mailboxes = Vec::new();
    let mut handles = Vec::new();
    for (i, Participant { id, node }) in participants.into_iter().enumerate() {
        let engine_cfg = engine::Config {
            id,
            peers: ids.iter().copied().filter(|peer| *peer != id).collect(),
            peers_file: data_dir
                .as_ref()
                .filter(|_| i == 0)
                .map(|dir| dir.join(persist::FILE_NAME)),
            ..engine::Config::default()
        };
        let (actor, mailbox) = Actor::new(node, engine_cfg);
        let (sender, receiver, control) = network.register(id).expect("duplicate node");
        handles.push(actor.start(sender, receiver, control));
        mailboxes.push(mailbox);
    }
    info!(participants = count, "started network");

    // Mine blocks and hand them to everyone
    let mut chain = Chainstate::new(genesis, cfg.park_deep_reorg_depth);
    let blocks = *matches.get_one::<u32>("blocks").expect("missing blocks");
    for _ in 0..blocks {
        let height = chain.height() + 1;
        let miner = PrivateKey::from_seed(u64::from(height)).public_key();
        let coinbase = Transaction::coinbase(
            height,
            vec![TxOut {
                amount: avalanche::chain::BLOCK_SUBSIDY,
                owner: miner,
            }],
        );
        let timestamp = chain
            .block(&chain.tip())
            .map_or_else(now, |tip| tip.header.timestamp + 1);
        let block = Block::new(chain.tip(), height, timestamp, 1, 0, vec![coinbase]);
        let hash = chain.submit_block(block.clone()).expect("mined block rejected");
        for mailbox in &mut mailboxes {
            match mailbox.submit_block(block.clone()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(%hash, ?err, "block rejected"),
                Err(err) => warn!(%hash, ?err, "node stopped"),
            }
        }

        let start = Instant::now();
        let mut finalized = 0;
        for mailbox in &mut mailboxes {
            match timeout(wait, wait_final(mailbox, hash)).await {
                Ok(Ok(())) => finalized += 1,
                Ok(Err(err)) => warn!(%hash, ?err, "node stopped"),
                Err(_) => warn!(%hash, "timed out waiting for finalization"),
            }
        }
        let elapsed = start.elapsed();
        info!(%hash, height, finalized, ?elapsed, "block finalized");
    }

    // Report the view of the first node
    if let Some(first) = mailboxes.first_mut() {
        match first.call(rpc::get_avalanche_info).await {
            Ok(info) => match serde_json::to_string_pretty(&info) {
                Ok(json) => println!("{json}"),
                Err(err) => warn!(?err, "unable to serialize avalanche info"),
            },
            Err(err) => warn!(?err, "node stopped"),
        }
    }

    // Shutdown
    for mailbox in &mut mailboxes {
        if let Err(err) = mailbox.stop().await {
            warn!(?err, "node already stopped");
        }
    }
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(?err, "node task failed");
        }
    }
    if matches.get_flag("metrics") {
        let mut buffer = String::new();
        encode(&mut buffer, &registry).expect("unable to encode metrics");
        println!("{buffer}");
    }
}
