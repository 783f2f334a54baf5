//! systemd unit rendering.
//!
//! Pure text generation for every unit sloop manages: the umbrella target,
//! the accounting slice, per-bridge services, per-service nspawn units, and
//! timer pairs. Rendering is deterministic: all inputs arrive pre-resolved
//! and every collection iterated here is sorted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use sloop_core::error::Result;
use sloop_core::model::{Bridge, Service, ServiceType, Timer, TimerAction};
use sloop_core::paths::Paths;

pub const TARGET_UNIT: &str = "sloop.target";
pub const SLICE_UNIT: &str = "sloop.slice";

pub const TARGET_TEXT: &str = "\
[Unit]
Description=Sloop target
Before=multi-user.target

[Install]
WantedBy=multi-user.target
";

pub const SLICE_TEXT: &str = "\
[Unit]
Description=Slice used to run sloop services
Before=slices.target

[Slice]
MemoryAccounting=true
IOAccounting=true
CPUAccounting=true
";

/// Network namespace owned by a service.
pub fn netns_name(service: &str) -> String {
    format!("sloop-{service}")
}

/// Cap a string to the kernel's 15-byte interface-name limit.
///
/// Identity for short names; longer names keep an 11-byte prefix and gain 4
/// bytes of base64(SHA-256) so distinct long names stay distinct.
pub fn cap_ifname(source: &str) -> String {
    const MAX: usize = 15;
    if source.len() <= MAX {
        return source.to_string();
    }
    let digest = Sha256::digest(source.as_bytes());
    let mut b64 = BASE64_STANDARD.encode(digest);
    while b64.len() < 4 {
        b64.push('1');
    }
    format!("{}{}", &source[..MAX - 4], &b64[..4])
}

/// Host-side veth name for a service interface.
pub fn host_ifname(service: &str, iface: &str) -> String {
    cap_ifname(&format!("{service}-{iface}"))
}

/// Quote an argv the way it is embedded in unit files.
fn quote_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|a| format!("{a:?}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Source path of a per-service overlay file on the host.
pub fn overlay_source(paths: &Paths, service: &str, overlay: &Path) -> PathBuf {
    let rel = overlay.strip_prefix("/").unwrap_or(overlay);
    paths.service(service).join("files").join(rel)
}

/// Every bind mount of a service, keyed by host path.
fn service_binds(service: &Service, paths: &Paths) -> BTreeMap<PathBuf, PathBuf> {
    let mut binds = BTreeMap::new();
    for mapping in &service.image.volumes {
        let host = if mapping.name.starts_with('/') {
            PathBuf::from(&mapping.name)
        } else {
            paths.volume(&mapping.name)
        };
        binds.insert(host, mapping.dest.clone());
    }
    for overlay in service.image.files.keys() {
        binds.insert(
            overlay_source(paths, &service.name, overlay),
            overlay.clone(),
        );
    }
    binds
}

pub fn render_bridge(bridge: &Bridge) -> Result<String> {
    let network = bridge.network()?;
    let name = &bridge.name;
    let ip = bridge.ip;
    let prefix = bridge.prefix;

    let mut text = String::new();
    text.push_str(&format!(
        "\
[Unit]
Description=Sloop bridge {name}
After=network-online.target
StopWhenUnneeded=yes

[Service]
Slice=sloop.slice
Type=oneshot
RemainAfterExit=true

ExecStart=sysctl net.ipv4.ip_forward=1
ExecStart=ip link add {name} type bridge
ExecStart=ip link set {name} up
ExecStart=ip addr add {ip}/{prefix} dev {name}
ExecStart=iptables -t nat -A POSTROUTING -s {network}/{prefix} ! -o {name} -j MASQUERADE

ExecStop=iptables -t nat -D POSTROUTING -s {network}/{prefix} ! -o {name} -j MASQUERADE
ExecStop=ip link delete {name}

[Install]
WantedBy=sloop.target
"
    ));
    Ok(text)
}

/// Render a service unit.
///
/// `start` is the resolved command line: the configured `exec.start`, or the
/// image entrypoint when that is empty. The caller resolves it so rendering
/// stays pure.
pub fn render_service(service: &Service, paths: &Paths, start: &[String]) -> String {
    let name = &service.name;
    let service_dir = paths.service(name);
    let netns = netns_name(name);
    let notify = service.service_type != ServiceType::Oneshot;

    let wants: Vec<String> = service.wants.iter().map(|d| d.unit_name()).collect();
    let mut requires: Vec<String> = service.requires.iter().map(|d| d.unit_name()).collect();
    let mut after: Vec<String> = service.after.iter().map(|d| d.unit_name()).collect();
    if service.net.private {
        for iface in service.net.interfaces.values() {
            let unit = iface.bridge.unit_name();
            requires.push(unit.clone());
            after.push(unit);
        }
    }

    let mut text = String::new();
    text.push_str("[Unit]\n");
    text.push_str(&format!("Description=Sloop service {name}\n"));
    text.push_str("PartOf=sloop.target\n");
    text.push_str("Before=sloop.target\n");
    for dep in &wants {
        text.push_str(&format!("Wants={dep}\n"));
    }
    for dep in &requires {
        text.push_str(&format!("Requires={dep}\n"));
    }
    for dep in &after {
        text.push_str(&format!("After={dep}\n"));
    }

    text.push_str("\n[Service]\n");
    text.push_str("Slice=sloop.slice\n");
    if notify {
        text.push_str("Type=notify\n");
        text.push_str("NotifyAccess=all\n");
        text.push_str("RestartForceExitStatus=133\n");
        text.push_str("SuccessExitStatus=133\n");
    } else {
        text.push_str("Type=oneshot\n");
    }
    text.push_str("KillMode=mixed\n");
    text.push_str("Delegate=yes\n");

    if service.net.private {
        text.push('\n');
        text.push_str(&format!("ExecStartPre=ip netns add {netns}\n"));
        text.push_str(&format!(
            "ExecStartPre=ip netns exec {netns} ip link set lo up\n"
        ));
        for iface in service.net.interfaces.values() {
            let host_if = host_ifname(name, &iface.name);
            let peer = &iface.name;
            let bridge = &iface.bridge;
            text.push_str(&format!(
                "ExecStartPre=ip link add {host_if} type veth peer {peer} netns {netns}\n"
            ));
            text.push_str(&format!("ExecStartPre=ip link set dev {host_if} up\n"));
            text.push_str(&format!(
                "ExecStartPre=ip link set dev {host_if} master {}\n",
                bridge.name
            ));
            text.push_str(&format!(
                "ExecStartPre=ip netns exec {netns} ip link set {peer} up\n"
            ));
            text.push_str(&format!(
                "ExecStartPre=ip netns exec {netns} ip addr add {}/{} dev {peer}\n",
                iface.ip, bridge.prefix
            ));
            text.push_str(&format!(
                "ExecStartPre=ip netns exec {netns} ip route add default via {}\n",
                bridge.ip
            ));
        }
        for iface in service.net.interfaces.values() {
            text.push_str(&format!(
                "ExecStopPost=-ip netns exec {netns} ip link delete {}\n",
                iface.name
            ));
        }
        text.push_str(&format!("ExecStopPost=-ip netns delete {netns}\n"));
    }

    text.push('\n');
    text.push_str("ExecStart=systemd-nspawn \\\n");
    let mut flag = |f: String| {
        text.push_str(&format!("\t{f} \\\n"));
    };
    flag("--quiet".into());
    flag("--volatile=overlay".into());
    flag("--keep-unit".into());
    flag("--register=no".into());
    flag("--kill-signal=SIGTERM".into());
    flag(format!("--oci-bundle={}", service_dir.display()));
    flag(format!("-M {name}"));
    flag("--resolv-conf=bind-uplink".into());
    flag(format!(
        "--bind-ro={}/hosts:/etc/hosts",
        service_dir.display()
    ));
    flag(format!(
        "--bind={}:/catatonit",
        paths.init().display()
    ));
    if service.net.private {
        flag(format!("--network-namespace-path=/var/run/netns/{netns}"));
    }
    if notify {
        flag("--bind=/run/systemd/notify".into());
    }
    for (host, dest) in service_binds(service, paths) {
        flag(format!("--bind={}:{}", host.display(), dest.display()));
    }
    if !service.capabilities.is_empty() {
        flag(format!("--capability={}", service.capabilities.join(",")));
    }
    text.push_str(&format!("\t/catatonit -- {}\n", quote_argv(start)));

    if !service.exec.reload.is_empty() {
        text.push_str(&format!(
            "ExecReload={} {name} {}\n",
            paths.nsenter().display(),
            quote_argv(&service.exec.reload)
        ));
    }
    if notify {
        text.push_str("Environment=NOTIFY_SOCKET=\n");
    }

    if service.enable {
        text.push_str("\n[Install]\nWantedBy=sloop.target\n");
    }
    text
}

pub fn render_timer(timer: &Timer) -> String {
    let name = &timer.name;
    let mut text = String::new();
    text.push_str("[Unit]\n");
    text.push_str(&format!("Description=Sloop timer {name}\n"));
    text.push_str("PartOf=sloop.target\n");
    text.push_str("\n[Timer]\n");
    for cal in &timer.on_calendar {
        text.push_str(&format!("OnCalendar={cal}\n"));
    }
    for act in &timer.on_active_sec {
        text.push_str(&format!("OnActiveSec={act}\n"));
    }
    text.push_str(&format!("Persistent={}\n", timer.persistent));
    text.push_str("\n[Install]\nWantedBy=sloop.target\n");
    text
}

/// The oneshot service a timer activates.
pub fn render_timer_service(timer: &Timer) -> String {
    let name = &timer.name;
    let mut text = String::new();
    text.push_str("[Unit]\n");
    text.push_str(&format!("Description=Sloop timer unit {name}\n"));
    text.push_str("\n[Service]\n");
    text.push_str("Type=oneshot\n");
    for run in &timer.run {
        let verb = match run.action {
            TimerAction::Start => "start",
            TimerAction::Reload => "reload",
        };
        text.push_str(&format!("ExecStart=systemctl {verb} {}.service\n", run.service));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use sloop_core::model::{
        Dependency, Exec, File, Image, Interface, Network, TimerRun, VolumeMapping,
    };
    use std::collections::BTreeMap;

    fn paths() -> Paths {
        Paths::new("/var/lib/sloop").unwrap()
    }

    fn bridge() -> Bridge {
        Bridge {
            name: "br0".into(),
            ip: "10.0.0.1".parse().unwrap(),
            prefix: 24,
        }
    }

    fn base_service(name: &str) -> Service {
        Service {
            name: name.into(),
            image: Image {
                from: "alpine:3".into(),
                files: BTreeMap::new(),
                env: BTreeMap::new(),
                volumes: vec![],
            },
            exec: Exec {
                start: vec!["/bin/sh".into(), "-c".into(), "sleep 1".into()],
                reload: vec![],
            },
            net: Network::default(),
            service_type: ServiceType::Oneshot,
            enable: true,
            capabilities: vec![],
            wants: vec![],
            requires: vec![],
            after: vec![],
        }
    }

    #[test]
    fn test_cap_ifname_identity_for_short_names() {
        assert_eq!(cap_ifname("hello-eth0"), "hello-eth0");
        assert_eq!(cap_ifname("exactly15chars0"), "exactly15chars0");
    }

    #[test]
    fn test_cap_ifname_truncates_to_15() {
        let long = "extremely-long-service-eth0";
        let capped = cap_ifname(long);
        assert_eq!(capped.len(), 15);
        assert_eq!(&capped[..11], &long[..11]);
        let digest = Sha256::digest(long.as_bytes());
        let b64 = BASE64_STANDARD.encode(digest);
        assert_eq!(&capped[11..], &b64[..4]);
    }

    #[test]
    fn test_cap_ifname_depends_on_full_input() {
        let a = cap_ifname("very-long-service-name-a");
        let b = cap_ifname("very-long-service-name-b");
        assert_eq!(&a[..11], &b[..11]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_public_oneshot_service_unit() {
        let svc = base_service("hello");
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("Description=Sloop service hello"));
        assert!(text.contains("Type=oneshot\n"));
        assert!(text.contains("Slice=sloop.slice\n"));
        assert!(text.contains("KillMode=mixed\n"));
        assert!(text.contains("Delegate=yes\n"));
        assert!(text.contains("--oci-bundle=/var/lib/sloop/services/hello"));
        assert!(text.contains("--bind-ro=/var/lib/sloop/services/hello/hosts:/etc/hosts"));
        assert!(text.contains("--bind=/var/lib/sloop/utils/init:/catatonit"));
        assert!(text.contains("/catatonit -- \"/bin/sh\" \"-c\" \"sleep 1\"\n"));
        assert!(!text.contains("--network-namespace-path"));
        assert!(!text.contains("NotifyAccess"));
        assert!(!text.contains("NOTIFY_SOCKET"));
        assert!(text.contains("[Install]\nWantedBy=sloop.target\n"));
    }

    #[test]
    fn test_notify_service_unit() {
        let mut svc = base_service("web");
        svc.service_type = ServiceType::Notify;
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("Type=notify\n"));
        assert!(text.contains("NotifyAccess=all\n"));
        assert!(text.contains("RestartForceExitStatus=133\n"));
        assert!(text.contains("SuccessExitStatus=133\n"));
        assert!(text.contains("--bind=/run/systemd/notify"));
        assert!(text.contains("Environment=NOTIFY_SOCKET=\n"));
    }

    #[test]
    fn test_simple_type_renders_as_notify() {
        let mut svc = base_service("web");
        svc.service_type = ServiceType::Simple;
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("Type=notify\n"));
    }

    #[test]
    fn test_disabled_service_has_no_install_section() {
        let mut svc = base_service("hello");
        svc.enable = false;
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(!text.contains("[Install]"));
    }

    #[test]
    fn test_private_service_netns_setup() {
        let mut svc = base_service("hello");
        let br = bridge();
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "eth0".to_string(),
            Interface {
                name: "eth0".into(),
                ip: "10.0.0.17".parse().unwrap(),
                bridge: br.clone(),
            },
        );
        svc.net = Network {
            private: true,
            interfaces,
        };
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("ExecStartPre=ip netns add sloop-hello\n"));
        assert!(text.contains("ExecStartPre=ip netns exec sloop-hello ip link set lo up\n"));
        assert!(text.contains(
            "ExecStartPre=ip link add hello-eth0 type veth peer eth0 netns sloop-hello\n"
        ));
        assert!(text.contains("ExecStartPre=ip link set dev hello-eth0 master br0\n"));
        assert!(text.contains(
            "ExecStartPre=ip netns exec sloop-hello ip addr add 10.0.0.17/24 dev eth0\n"
        ));
        assert!(text.contains(
            "ExecStartPre=ip netns exec sloop-hello ip route add default via 10.0.0.1\n"
        ));
        assert!(text.contains("ExecStopPost=-ip netns exec sloop-hello ip link delete eth0\n"));
        assert!(text.contains("ExecStopPost=-ip netns delete sloop-hello\n"));
        assert!(text.contains("--network-namespace-path=/var/run/netns/sloop-hello"));
        // Bridge units are required and ordered before the service.
        assert!(text.contains("Requires=sloop-bridge-br0.service\n"));
        assert!(text.contains("After=sloop-bridge-br0.service\n"));
    }

    #[test]
    fn test_dependencies_are_qualified() {
        let mut svc = base_service("app");
        svc.wants = vec![Dependency::parse("db")];
        svc.requires = vec![Dependency::parse("cache")];
        svc.after = vec![
            Dependency::parse("db"),
            Dependency::parse("network-online.target"),
            Dependency::parse("sshd.socket"),
        ];
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("Wants=db.service\n"));
        assert!(text.contains("Requires=cache.service\n"));
        assert!(text.contains("After=db.service\n"));
        assert!(text.contains("After=network-online.target\n"));
        assert!(text.contains("After=sshd.socket\n"));
        for line in text.lines() {
            if let Some(dep) = line
                .strip_prefix("Wants=")
                .or_else(|| line.strip_prefix("Requires="))
                .or_else(|| line.strip_prefix("After="))
            {
                assert!(
                    dep.ends_with(".service")
                        || dep.ends_with(".target")
                        || dep.ends_with(".socket"),
                    "unqualified dependency: {dep}"
                );
            }
        }
    }

    #[test]
    fn test_binds_volumes_and_overlay_files() {
        let mut svc = base_service("app");
        svc.image.volumes = vec![
            VolumeMapping {
                name: "data".into(),
                dest: "/var/lib/data".into(),
            },
            VolumeMapping {
                name: "/srv/shared".into(),
                dest: "/shared".into(),
            },
        ];
        svc.image.files.insert(
            "/etc/app.conf".into(),
            File {
                content: "x".into(),
                permissions: 0o644,
            },
        );
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("--bind=/var/lib/sloop/volumes/data:/var/lib/data"));
        assert!(text.contains("--bind=/srv/shared:/shared"));
        assert!(text.contains(
            "--bind=/var/lib/sloop/services/app/files/etc/app.conf:/etc/app.conf"
        ));
    }

    #[test]
    fn test_capabilities_joined() {
        let mut svc = base_service("app");
        svc.capabilities = vec!["CAP_NET_ADMIN".into(), "CAP_SYS_TIME".into()];
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains("--capability=CAP_NET_ADMIN,CAP_SYS_TIME"));
    }

    #[test]
    fn test_exec_reload() {
        let mut svc = base_service("app");
        svc.exec.reload = vec!["nginx".into(), "-s".into(), "reload".into()];
        let text = render_service(&svc, &paths(), &svc.exec.start);
        assert!(text.contains(
            "ExecReload=/var/lib/sloop/utils/nsenter app \"nginx\" \"-s\" \"reload\"\n"
        ));
        let without = base_service("app");
        let text = render_service(&without, &paths(), &without.exec.start);
        assert!(!text.contains("ExecReload"));
    }

    #[test]
    fn test_bridge_unit_masquerades_subnet_base() {
        let text = render_bridge(&bridge()).unwrap();
        assert!(text.contains("Description=Sloop bridge br0"));
        assert!(text.contains("StopWhenUnneeded=yes\n"));
        assert!(text.contains("RemainAfterExit=true\n"));
        assert!(text.contains("ExecStart=sysctl net.ipv4.ip_forward=1\n"));
        assert!(text.contains("ExecStart=ip link add br0 type bridge\n"));
        assert!(text.contains("ExecStart=ip addr add 10.0.0.1/24 dev br0\n"));
        assert!(text.contains(
            "ExecStart=iptables -t nat -A POSTROUTING -s 10.0.0.0/24 ! -o br0 -j MASQUERADE\n"
        ));
        assert!(text.contains(
            "ExecStop=iptables -t nat -D POSTROUTING -s 10.0.0.0/24 ! -o br0 -j MASQUERADE\n"
        ));
        assert!(text.contains("ExecStop=ip link delete br0\n"));
    }

    #[test]
    fn test_timer_units() {
        let timer = Timer {
            name: "backup".into(),
            run: vec![
                TimerRun {
                    service: "db".into(),
                    action: TimerAction::Start,
                },
                TimerRun {
                    service: "web".into(),
                    action: TimerAction::Reload,
                },
            ],
            on_calendar: vec!["daily".into()],
            on_active_sec: vec!["15min".into()],
            persistent: true,
        };
        let timer_text = render_timer(&timer);
        assert!(timer_text.contains("Description=Sloop timer backup"));
        assert!(timer_text.contains("OnCalendar=daily\n"));
        assert!(timer_text.contains("OnActiveSec=15min\n"));
        assert!(timer_text.contains("Persistent=true\n"));
        assert!(timer_text.contains("WantedBy=sloop.target\n"));

        let service_text = render_timer_service(&timer);
        assert!(service_text.contains("Type=oneshot\n"));
        assert!(service_text.contains("ExecStart=systemctl start db.service\n"));
        assert!(service_text.contains("ExecStart=systemctl reload web.service\n"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let mut svc = base_service("app");
        svc.image.env.insert("B".into(), "2".into());
        svc.image.env.insert("A".into(), "1".into());
        let a = render_service(&svc, &paths(), &svc.exec.start);
        let b = render_service(&svc, &paths(), &svc.exec.start);
        assert_eq!(a, b);
    }
}
