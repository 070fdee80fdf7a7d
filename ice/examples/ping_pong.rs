//! Runs two ICE stacks in the same process, each bound to a loopback UDP
//! socket, and drives them through connectivity checks to a nominated pair.
//! There is no harvester here: the two host candidates are constructed by
//! hand, which is the shape a real caller's gathering step would hand the
//! check-list engine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use webrtc_ice as ice;

use ice::candidate::candidate_base::CandidateBaseConfig;
use ice::candidate::candidate_host::CandidateHostConfig;
use ice::candidate::Candidate;
use ice::checklist::{CheckList, CheckListState};
use ice::control::Role;
use ice::net_access::Transport as NetTransport;
use ice::{Stack, StackConfig};

async fn bind_udp() -> (Arc<dyn util::Conn + Send + Sync>, SocketAddr) {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .expect("bind udp socket");
    let addr = socket.local_addr().expect("local addr");
    (Arc::new(socket), addr)
}

fn host_candidate(addr: SocketAddr, conn: Arc<dyn util::Conn + Send + Sync>) -> Arc<dyn Candidate + Send + Sync> {
    let cfg = CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: addr.ip().to_string(),
            port: addr.port(),
            component: 1,
            priority: 2_130_706_431,
            conn: Some(conn),
            ..Default::default()
        },
        ..Default::default()
    };
    Arc::new(cfg.new_candidate_host().expect("build host candidate"))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let (a_sock, a_addr) = bind_udp().await;
    let (b_sock, b_addr) = bind_udp().await;

    let a_candidate = host_candidate(a_addr, a_sock.clone());
    let b_candidate = host_candidate(b_addr, b_sock.clone());

    let stack_a = Stack::new(StackConfig::builder().local_credentials("Aufr", "Apwdpwdpwdpwdpwdpwdpwdpwd").build()).await;
    let stack_b = Stack::new(StackConfig::builder().local_credentials("Bufr", "Bpwdpwdpwdpwdpwdpwdpwdpwd").build()).await;

    stack_a.set_role(Role::Controlling);
    stack_b.set_role(Role::Controlled);

    stack_a.set_remote_credentials("Bufr", "Bpwdpwdpwdpwdpwdpwdpwdpwd");
    stack_b.set_remote_credentials("Aufr", "Apwdpwdpwdpwdpwdpwdpwdpwd");

    stack_a
        .add_socket(a_sock, a_addr, None, NetTransport::Udp)
        .await
        .expect("register A's connector");
    stack_b
        .add_socket(b_sock, b_addr, None, NetTransport::Udp)
        .await
        .expect("register B's connector");

    let checklist_a = Arc::new(CheckList::new("audio"));
    checklist_a.form_pairs(&[a_candidate.clone()], &[b_candidate.clone()], true).await;
    checklist_a.freeze_by_foundation().await;
    stack_a.register_checklist("audio", checklist_a.clone(), vec![a_candidate.clone()]).await;

    let checklist_b = Arc::new(CheckList::new("audio"));
    checklist_b.form_pairs(&[b_candidate.clone()], &[a_candidate.clone()], false).await;
    checklist_b.freeze_by_foundation().await;
    stack_b.register_checklist("audio", checklist_b.clone(), vec![b_candidate.clone()]).await;

    for _ in 0..100 {
        if checklist_a.state() == CheckListState::Completed && checklist_b.state() == CheckListState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let selected_a = checklist_a.selected_pair(1).await;
    let selected_b = checklist_b.selected_pair(1).await;

    match (selected_a, selected_b) {
        (Some(pa), Some(pb)) => {
            println!("A selected pair: {pa}");
            println!("B selected pair: {pb}");
        }
        _ => println!("ICE did not complete within the allotted ticks"),
    }

    stack_a.shutdown().await;
    stack_b.shutdown().await;
}
