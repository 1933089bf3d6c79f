//! SR-IOV virtual function lookups through sysfs.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Driver that exposes a VF to userspace without a netdevice
pub const VFIO_PCI: &str = "vfio-pci";

/// Everything needed to wire one virtual function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfInfo {
    /// VF netdevice, `None` when bound to vfio-pci
    pub netdev: Option<String>,
    /// Uplink (physical function) netdevice
    pub pf: String,
    pub index: u32,
    /// Switchdev representor of the VF
    pub representor: String,
}

/// Resolves VF details under a sysfs root, `/sys` in production
pub struct SriovResolver {
    sysfs_root: PathBuf,
}

/// True when the device id looks like a PCI address (`0000:3b:02.1`)
pub fn is_pci_address(device_id: &str) -> bool {
    let parts: Vec<&str> = device_id.split([':', '.']).collect();
    matches!(parts.as_slice(), [domain, bus, slot, func]
        if domain.len() == 4 && bus.len() == 2 && slot.len() == 2 && func.len() == 1
            && [domain, bus, slot, func].iter().all(|p| p.chars().all(|c| c.is_ascii_hexdigit())))
}

fn entries(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn link_basename(path: &Path) -> Option<String> {
    fs::read_link(path)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
}

/// Parse a representor port name: `pf0vf3`, `c1pf0vf3` or `vf3`
fn parse_port_name(name: &str) -> Option<(Option<u32>, u32)> {
    let name = match name.strip_prefix('c') {
        Some(rest) => rest.trim_start_matches(|c: char| c.is_ascii_digit()),
        None => name,
    };
    if let Some(rest) = name.strip_prefix("pf") {
        let (pf, vf) = rest.split_once("vf")?;
        return Some((Some(pf.parse().ok()?), vf.parse().ok()?));
    }
    name.strip_prefix("vf")?.parse().ok().map(|vf| (None, vf))
}

impl SriovResolver {
    pub fn new(sysfs_root: PathBuf) -> Self {
        Self { sysfs_root }
    }

    fn device_dir(&self, device_id: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(device_id)
    }

    fn class_net(&self) -> PathBuf {
        self.sysfs_root.join("class/net")
    }

    /// Kernel driver currently bound to the device
    pub fn driver(&self, device_id: &str) -> Option<String> {
        link_basename(&self.device_dir(device_id).join("driver"))
    }

    /// Resolve the VF netdevice, its uplink, index and representor.
    pub fn resolve(&self, device_id: &str, vf_driver: Option<&str>) -> Result<VfInfo> {
        let dev = self.device_dir(device_id);
        if !dev.exists() {
            bail!("PCI device {} not found", device_id);
        }

        let netdev = if vf_driver == Some(VFIO_PCI) {
            let bound = self.driver(device_id);
            if bound.as_deref() != Some(VFIO_PCI) {
                bail!(
                    "Driver of device {} is {:?}, not '{}'",
                    device_id,
                    bound,
                    VFIO_PCI
                );
            }
            None
        } else {
            let netdevs = entries(&dev.join("net"))?;
            match netdevs.as_slice() {
                [one] => Some(one.clone()),
                _ => bail!(
                    "Expected one netdevice for {}, found {}",
                    device_id,
                    netdevs.len()
                ),
            }
        };

        let (pf, index) = self.physical_function(device_id)?;
        let representor = self.representor(&pf, index)?;

        Ok(VfInfo {
            netdev,
            pf,
            index,
            representor,
        })
    }

    /// Uplink netdevice and VF index of a virtual function. Works after the
    /// VF netdevice has left the host namespace.
    pub fn physical_function(&self, device_id: &str) -> Result<(String, u32)> {
        let physfn = self.device_dir(device_id).join("physfn");
        let pf = entries(&physfn.join("net"))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No uplink netdevice for {}", device_id))?;
        let index = self.vf_index(&physfn, device_id)?;
        Ok((pf, index))
    }

    fn vf_index(&self, physfn: &Path, device_id: &str) -> Result<u32> {
        for name in entries(physfn)? {
            let Some(index) = name.strip_prefix("virtfn") else {
                continue;
            };
            if link_basename(&physfn.join(&name)).as_deref() == Some(device_id) {
                return index
                    .parse()
                    .with_context(|| format!("Malformed VF entry {name}"));
            }
        }
        Err(anyhow!("Device {} is not a VF of its physical function", device_id))
    }

    fn representor(&self, pf: &str, index: u32) -> Result<String> {
        let class_net = self.class_net();
        let switch_id = read_trimmed(&class_net.join(pf).join("phys_switch_id"))
            .ok_or_else(|| anyhow!("Uplink {} is not in switchdev mode", pf))?;
        // Uplink representors are named p0, p1, ...
        let pf_number = read_trimmed(&class_net.join(pf).join("phys_port_name"))
            .and_then(|n| n.strip_prefix('p').and_then(|d| d.parse::<u32>().ok()));

        for name in entries(&class_net)? {
            if name == pf {
                continue;
            }
            let dir = class_net.join(&name);
            if read_trimmed(&dir.join("phys_switch_id")).as_deref() != Some(switch_id.as_str()) {
                continue;
            }
            let Some(port) = read_trimmed(&dir.join("phys_port_name")) else {
                continue;
            };
            match parse_port_name(&port) {
                Some((rep_pf, vf)) if vf == index => {
                    if rep_pf.is_none() || pf_number.is_none() || rep_pf == pf_number {
                        return Ok(name);
                    }
                }
                _ => {}
            }
        }
        Err(anyhow!("No representor found for {} vf {}", pf, index))
    }
}
