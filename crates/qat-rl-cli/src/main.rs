//! `qat-rl`: command-line interface for QAT rate limiting.
//!
//! ```text
//! USAGE:
//!   qat-rl translate <svc> <cir> [pir]   Hardware tokens for a rate
//!   qat-rl caps                          Capabilities of a fresh device
//!   qat-rl tree                          Bootstrap tree of a fresh device
//!   qat-rl run <script>                  Replay an SLA script on a simulated device
//!   qat-rl links <pcie-addr>             Dump RL link tables from a live PF
//! ```
//!
//! Everything except `links` runs against a simulated device. Its profile is
//! set with `--services` and `--vfs`.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use qat_rl::mmio::MappedBar;
use qat_rl::pfvf::RateKind;
use qat_rl::prelude::*;
use qat_rl::{CsrAccess, RateRequest, VfioDevice};
use qat_rl_hw::{gen4, regs, tree};

#[derive(Parser)]
#[command(name = "qat-rl", about = "QAT rate limiting CLI", version)]
struct Cli {
    #[command(flatten)]
    profile: Profile,

    #[command(subcommand)]
    command: Cmd,
}

/// Simulated device profile
#[derive(Args)]
struct Profile {
    /// Enabled services, in root order.
    #[arg(long, value_delimiter = ',', default_value = "asym,sym,dc", global = true)]
    services: Vec<ServiceType>,
    /// VFs on the device.
    #[arg(long, default_value_t = 16, global = true)]
    vfs: u32,
}

#[derive(Subcommand)]
enum Cmd {
    /// Translate a rate into hardware token values.
    Translate {
        /// Service (asym, sym, dc).
        service: ServiceType,
        /// Committed rate.
        cir: u32,
        /// Peak rate; defaults to the committed rate.
        pir: Option<u32>,
    },
    /// Print capabilities of a freshly initialised device.
    Caps,
    /// Print the bootstrap tree of a freshly initialised device.
    Tree,
    /// Replay an SLA script against a simulated device.
    Run {
        /// Script file, one command per line.
        script: String,
    },
    /// Dump the RL link tables of a live device (requires root).
    Links {
        /// PCIe address of the PF (e.g. 0000:6b:00.0).
        pcie_addr: String,
        /// BAR holding the PMISC registers.
        #[arg(long, default_value_t = 4)]
        bar: u32,
        /// Map the BAR through VFIO instead of sysfs.
        #[arg(long)]
        vfio: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Translate { service, cir, pir } => {
            cmd_translate(service, cir, pir.unwrap_or(cir))?;
        }
        Cmd::Caps => cmd_caps(&cli.profile)?,
        Cmd::Tree => cmd_tree(&cli.profile)?,
        Cmd::Run { script } => cmd_run(&cli.profile, Path::new(&script))?,
        Cmd::Links {
            pcie_addr,
            bar,
            vfio,
        } => cmd_links(&pcie_addr, bar, vfio)?,
    }

    Ok(())
}

impl Profile {
    fn config(&self) -> DeviceConfig {
        DeviceConfig {
            enabled_services: self.services.clone(),
            total_vfs: self.vfs,
            num_vfs: self.vfs,
            ..DeviceConfig::gen4()
        }
    }

    fn start(&self) -> Result<(SimulatedDevice, RateLimiter)> {
        let device = SimulatedDevice::new();
        let rl = device
            .limiter(RlHwData::gen4(), self.config())
            .context("rate limiting init")?;
        Ok((device, rl))
    }
}

fn cmd_translate(service: ServiceType, cir: u32, pir: u32) -> Result<()> {
    let hw = RlHwData::gen4();
    let p = qat_rl::translate::translate(&hw, service, cir, pir)?;

    println!(
        "{service} cir {cir} pir {pir}  (service max {})",
        hw.service_max(service)
    );
    println!("               cir         pir");
    println!("PCIe in   {:>10}  {:>10}", p.pcie_in_cir, p.pcie_in_pir);
    println!("PCIe out  {:>10}  {:>10}", p.pcie_out_cir, p.pcie_out_pir);
    println!("Slice     {:>10}  {:>10}", p.slice_cir, p.slice_pir);
    println!("AE        {:>10}  {:>10}", p.ae_cir, p.ae_pir);
    Ok(())
}

fn cmd_caps(profile: &Profile) -> Result<()> {
    let (_device, rl) = profile.start()?;
    println!("{}", rl.capabilities());
    rl.exit();
    Ok(())
}

fn print_tree(rl: &RateLimiter) {
    let nodes = |t: NodeType| {
        (0..t.capacity())
            .filter_map(move |i| rl.node(NodeId::new(t, i)))
            .collect::<Vec<_>>()
    };
    let show = |n: &qat_rl::Node, indent: &str| match n.sla {
        Some(sla) => println!(
            "{indent}{} {} {}  cir {} pir {}  remaining {}",
            n.node_type, n.node_id, n.service, sla.cir, sla.pir, n.remaining_cir
        ),
        None => println!("{indent}{} {} {}  (no SLA)", n.node_type, n.node_id, n.service),
    };

    let clusters = nodes(NodeType::Cluster);
    let leaves = nodes(NodeType::Leaf);
    for root in nodes(NodeType::Root) {
        show(&root, "");
        for cluster in clusters.iter().filter(|c| c.parent == Some(root.node_id)) {
            show(cluster, "  ");
            for leaf in leaves
                .iter()
                .filter(|l| l.sla_added && l.parent == Some(cluster.node_id))
            {
                show(leaf, "    ");
            }
        }
    }
    let idle = leaves.iter().filter(|l| !l.sla_added).count();
    println!("{idle} leaves without SLA");
}

fn cmd_tree(profile: &Profile) -> Result<()> {
    let (_device, rl) = profile.start()?;
    print_tree(&rl);
    rl.exit();
    Ok(())
}

fn parse_node(s: &str) -> Result<NodeId> {
    let (kind, index) = s
        .split_once(':')
        .with_context(|| format!("node '{s}' is not <type>:<index>"))?;
    Ok(NodeId::new(kind.parse()?, index.parse()?))
}

fn arg<'a>(words: &[&'a str], i: usize) -> Result<&'a str> {
    words
        .get(i)
        .copied()
        .with_context(|| format!("missing argument {i}"))
}

/// One script line. Blank lines and `#` comments are skipped.
///
/// ```text
/// node <type> <svc>                      allocate a cluster or leaf
/// rm <type>:<index>                      free a node
/// cluster <cluster:i> <svc> <cir> <pir>  cluster SLA
/// vf <vf> <svc> <cir> <pir>              leaf SLA for a VF's default leaf
/// leaf <leaf:i> <cluster:j> <vf> <svc> <cir> <pir>
/// update <type>:<index> <cir> <pir> [cluster:j]
/// delete <type>:<index>                  remove an SLA
/// query <cir|pir> <vf> <bank>            VF rate query
/// caps | slas | tree
/// ```
fn run_line(rl: &RateLimiter, words: &[&str]) -> Result<()> {
    let u = |i: usize| -> Result<u32> { Ok(arg(words, i)?.parse()?) };

    match words[0] {
        "node" => {
            let id = rl.create_node(arg(words, 1)?.parse()?, arg(words, 2)?.parse()?)?;
            println!("  -> {id}");
        }
        "rm" => rl.delete_node(parse_node(arg(words, 1)?)?)?,
        "cluster" => {
            let id = parse_node(arg(words, 1)?)?;
            rl.create_sla(Sla::cluster(id, arg(words, 2)?.parse()?, u(3)?, u(4)?))?;
        }
        "vf" => {
            let pci = PciAddress::from_vf(u(1)?);
            let sla = rl.leaf_request(pci, arg(words, 2)?.parse()?, u(3)?, u(4)?)?;
            let id = rl.create_sla(sla)?;
            println!("  -> {id}");
        }
        "leaf" => {
            let sla = Sla::leaf(
                parse_node(arg(words, 1)?)?,
                parse_node(arg(words, 2)?)?,
                arg(words, 4)?.parse()?,
                PciAddress::from_vf(u(3)?),
                u(5)?,
                u(6)?,
            );
            rl.create_sla(sla)?;
        }
        "update" => {
            let mut sla = Sla::update(parse_node(arg(words, 1)?)?, u(2)?, u(3)?);
            if let Some(parent) = words.get(4) {
                sla = sla.with_parent(parse_node(parent)?);
            }
            rl.update_sla(sla)?;
        }
        "delete" => rl.delete_sla(parse_node(arg(words, 1)?)?)?,
        "query" => {
            let msg_type = match arg(words, 1)? {
                "cir" => RateKind::Cir.request_type(),
                "pir" => RateKind::Pir.request_type(),
                other => bail!("unknown rate '{other}'"),
            };
            let req = RateRequest::from_message(msg_type, u(2)?, u(3)?)?;
            let resp = rl.handle_rate_request(req)?;
            println!(
                "  -> type {:#04x} data {:#010x} ({} = {})",
                resp.msg_type,
                resp.data,
                words[1],
                resp.value()
            );
        }
        "caps" => println!("{}", rl.capabilities()),
        "slas" => {
            for sla in rl.user_slas() {
                println!(
                    "  {} {} vf {} cir {} pir {}",
                    sla.sla_id,
                    sla.service,
                    sla.pci.vf_number().unwrap_or_default(),
                    sla.cir,
                    sla.pir
                );
            }
        }
        "tree" => print_tree(rl),
        other => bail!("unknown command '{other}'"),
    }
    Ok(())
}

fn cmd_run(profile: &Profile, script: &Path) -> Result<()> {
    let text = fs::read_to_string(script)
        .with_context(|| format!("reading {}", script.display()))?;
    let (device, rl) = profile.start()?;

    let mut failures = 0;
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        println!("{:>3}: {line}", n + 1);
        let words: Vec<&str> = line.split_whitespace().collect();
        if let Err(e) = run_line(&rl, &words) {
            failures += 1;
            println!("  !! {e:#}");
        }
    }

    rl.exit();
    println!();
    println!(
        "{failures} failed; firmware saw {} requests, {} DMA blocks leaked",
        device.firmware.records().len(),
        device.pool.outstanding()
    );
    Ok(())
}

fn cmd_links(pcie_addr: &str, bar: u32, vfio: bool) -> Result<()> {
    let csr = if vfio {
        VfioDevice::open(pcie_addr)?.map_bar(bar)
    } else {
        MappedBar::from_sysfs(pcie_addr, bar)
    }
    .with_context(|| format!("mapping BAR{bar} of {pcie_addr}"))?;
    println!("{pcie_addr} BAR{} ({} bytes)", csr.bar(), csr.size());

    let dump = |name: &str, base: usize, count: u32| {
        for i in 0..count {
            let value = csr.read32(regs::link_entry(base, i));
            if value != regs::LINK_NONE {
                println!("{name}[{i:>2}] -> {}", value & !regs::LINK_VALID);
            }
        }
    };
    dump("ring2leaf", regs::RL_RING2LEAF, gen4::MAX_BANKS);
    dump("leaf2cluster", regs::RL_LEAF2CLUSTER, tree::MAX_LEAF);
    dump("cluster2service", regs::RL_CLUSTER2SERVICE, tree::MAX_CLUSTER);
    Ok(())
}
