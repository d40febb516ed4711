use runner_image_common::signal::SIGNAL_PREFIX;
use runner_image_common::{Arch, BaseImage, RunnerVersion};

pub const DEFAULT_APT_PACKAGES: &[&str] = &[
    "docker.io",
    "npm",
    "python3-pip",
    "shellcheck",
    "jq",
    "wget",
    "unzip",
    "gh",
];

const RUNNER_RELEASES_API: &str = "https://api.github.com/repos/actions/runner/releases/latest";
const RUNNER_DOWNLOAD_BASE: &str = "https://github.com/actions/runner/releases/download";
const APT_PROXY_CONF: &str = "/etc/apt/apt.conf.d/99-image-builder-proxy";

#[derive(Debug, Clone)]
pub struct PayloadConfig<'a> {
    pub arch: Arch,
    pub base: BaseImage,
    pub runner_version: &'a RunnerVersion,
    /// `host:port`, used only while the image is being built.
    pub proxy: Option<&'a str>,
    pub signal_token: &'a str,
}

/// Check a proxy value is `host:port` without a scheme.
pub fn validate_proxy(proxy: &str) -> Result<(), String> {
    if proxy.contains("://") {
        return Err(format!("proxy '{}' must be host:port without a scheme", proxy));
    }
    let Some((host, port)) = proxy.rsplit_once(':') else {
        return Err(format!("proxy '{}' must be host:port", proxy));
    };
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return Err(format!("proxy '{}' has an invalid host", proxy));
    }
    if port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
        return Err(format!("proxy '{}' has an invalid port", proxy));
    }
    Ok(())
}

/// Bash user-data run once by cloud-init on the builder VM.
///
/// Its last act is writing the build signal marker to the serial console, which
/// the launcher reads back through the console-output API.
pub fn generate_payload(cfg: &PayloadConfig<'_>) -> String {
    let mut s = String::new();
    s.push_str("#!/bin/bash\n");
    s.push_str("set -Eeuo pipefail\n");
    s.push_str("\n");
    s.push_str(&format!("SIGNAL_TOKEN=\"{}\"\n", cfg.signal_token));
    s.push_str(&format!("RUNNER_VERSION=\"{}\"\n", cfg.runner_version));
    s.push_str(&format!("RUNNER_ARCH=\"{}\"\n", cfg.arch.runner_arch()));
    s.push_str(&format!("HWE_VERSION=\"{}\"\n", cfg.base.version_tag()));
    s.push_str(&format!(
        "APT_PACKAGES=\"{}\"\n",
        DEFAULT_APT_PACKAGES.join(" ")
    ));
    s.push_str("export DEBIAN_FRONTEND=noninteractive\n");
    s.push_str("\n");
    s.push_str("signal() {\n");
    s.push_str(&format!(
        "  local line=\"{}:${{SIGNAL_TOKEN}}:$1\"\n",
        SIGNAL_PREFIX
    ));
    s.push_str("  echo \"$line\" > /dev/console || true\n");
    s.push_str("  echo \"$line\"\n");
    s.push_str("}\n");
    s.push_str("trap 'signal \"failed:line ${LINENO}: ${BASH_COMMAND}\"; exit 1' ERR\n");
    s.push_str("\n");

    if let Some(proxy) = cfg.proxy {
        s.push_str("# Proxy for the duration of the build only\n");
        s.push_str(&format!("export http_proxy=\"http://{}\"\n", proxy));
        s.push_str(&format!("export https_proxy=\"http://{}\"\n", proxy));
        s.push_str("export no_proxy=\"127.0.0.1,localhost,::1\"\n");
        s.push_str("export HTTP_PROXY=\"$http_proxy\" HTTPS_PROXY=\"$https_proxy\" NO_PROXY=\"$no_proxy\"\n");
        s.push_str(&format!(
            "printf 'Acquire::http::Proxy \"http://%s\";\\nAcquire::https::Proxy \"http://%s\";\\n' \"{0}\" \"{0}\" > {1}\n",
            proxy, APT_PROXY_CONF
        ));
        s.push_str("\n");
    }

    s.push_str("echo '[image-builder] installing packages'\n");
    s.push_str("apt-get update -y\n");
    s.push_str("apt-get upgrade -y\n");
    s.push_str("# shellcheck disable=SC2086\n");
    s.push_str("apt-get install -y --no-install-recommends $APT_PACKAGES \"linux-generic-hwe-${HWE_VERSION}\"\n");
    s.push_str("usermod -aG docker ubuntu\n");
    s.push_str("\n");

    s.push_str("echo '[image-builder] installing GitHub Actions runner'\n");
    s.push_str("if [ \"$RUNNER_VERSION\" = \"latest\" ]; then\n");
    s.push_str(&format!(
        "  RUNNER_VERSION=\"$(curl -fsSL {} | jq -r .tag_name)\"\n",
        RUNNER_RELEASES_API
    ));
    s.push_str("  RUNNER_VERSION=\"${RUNNER_VERSION#v}\"\n");
    s.push_str("fi\n");
    s.push_str("RUNNER_TARBALL=\"actions-runner-linux-${RUNNER_ARCH}-${RUNNER_VERSION}.tar.gz\"\n");
    s.push_str("mkdir -p /home/ubuntu/actions-runner\n");
    s.push_str(&format!(
        "curl -fsSL -o \"/tmp/${{RUNNER_TARBALL}}\" \"{}/v${{RUNNER_VERSION}}/${{RUNNER_TARBALL}}\"\n",
        RUNNER_DOWNLOAD_BASE
    ));
    s.push_str("tar -xzf \"/tmp/${RUNNER_TARBALL}\" -C /home/ubuntu/actions-runner\n");
    s.push_str("chown -R ubuntu:ubuntu /home/ubuntu/actions-runner\n");
    s.push_str("rm -f \"/tmp/${RUNNER_TARBALL}\"\n");
    s.push_str("\n");

    s.push_str("echo '[image-builder] cleaning up'\n");
    s.push_str("apt-get clean\n");
    s.push_str("rm -rf /var/lib/apt/lists/*\n");
    if cfg.proxy.is_some() {
        s.push_str(&format!("rm -f {}\n", APT_PROXY_CONF));
        s.push_str("unset http_proxy https_proxy no_proxy HTTP_PROXY HTTPS_PROXY NO_PROXY\n");
    }
    s.push_str("cloud-init clean --logs\n");
    s.push_str("sync\n");
    s.push_str("\n");
    s.push_str("signal success\n");
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_image_common::signal::{scan_console, BuildSignal};

    fn payload(proxy: Option<&str>, version: &RunnerVersion) -> String {
        generate_payload(&PayloadConfig {
            arch: Arch::Arm64,
            base: BaseImage::Jammy,
            runner_version: version,
            proxy,
            signal_token: "run-123",
        })
    }

    #[test]
    fn embeds_arch_release_and_version() {
        let version = RunnerVersion::Pinned("2.317.0".to_string());
        let script = payload(None, &version);
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("RUNNER_VERSION=\"2.317.0\""));
        assert!(script.contains("RUNNER_ARCH=\"arm64\""));
        assert!(script.contains("HWE_VERSION=\"22.04\""));
        assert!(script.contains("docker.io npm python3-pip shellcheck jq wget unzip gh"));
        assert!(script.contains("SIGNAL_TOKEN=\"run-123\""));
        assert!(!script.contains("http_proxy"));
    }

    #[test]
    fn latest_is_resolved_in_guest() {
        let script = payload(None, &RunnerVersion::Latest);
        assert!(script.contains("RUNNER_VERSION=\"latest\""));
        assert!(script.contains(RUNNER_RELEASES_API));
    }

    #[test]
    fn proxy_is_configured_and_removed() {
        let script = payload(Some("squid.internal:3128"), &RunnerVersion::Latest);
        assert!(script.contains("export http_proxy=\"http://squid.internal:3128\""));
        assert!(script.contains(&format!("rm -f {}", APT_PROXY_CONF)));
        let set_at = script.find("export http_proxy").unwrap();
        let unset_at = script.find("unset http_proxy").unwrap();
        assert!(set_at < unset_at);
    }

    #[test]
    fn script_text_never_looks_like_a_signal() {
        let script = payload(Some("p:1"), &RunnerVersion::Latest);
        assert_eq!(scan_console(&script, "run-123"), None);
        assert!(script.trim_end().ends_with("signal success"));
        assert!(matches!(
            scan_console("image-builder-signal:run-123:success", "run-123"),
            Some(BuildSignal::Succeeded)
        ));
    }

    #[test]
    fn proxy_validation() {
        assert!(validate_proxy("proxy.example:3128").is_ok());
        assert!(validate_proxy("http://proxy:3128").is_err());
        assert!(validate_proxy("proxy").is_err());
        assert!(validate_proxy("proxy:0").is_err());
        assert!(validate_proxy("proxy:http").is_err());
        assert!(validate_proxy(":3128").is_err());
    }
}
