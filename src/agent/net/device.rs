use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use rtnetlink::{Handle, new_connection, packet_route::link::LinkAttribute};
use tokio::{spawn, task::JoinHandle};

const SIOCBRADDIF: libc::Ioctl = 0x89a2;

const DEV_NET_TUN: *const libc::c_char = c"/dev/net/tun".as_ptr();

/// Host-side network operations the provisioner is built from.
#[async_trait]
pub trait NetOps: Send + Sync {
    async fn device_exists(&self, name: &str) -> Result<bool>;

    /// Deletes the link if present. Returns whether anything was removed.
    async fn delete_device(&self, name: &str) -> Result<bool>;

    async fn create_tap(&self, name: &str) -> Result<()>;

    async fn set_sysctl(&self, key: &str, value: &str) -> Result<()>;

    async fn attach_to_bridge(&self, name: &str, bridge_name: &str) -> Result<()>;

    async fn set_up(&self, name: &str) -> Result<()>;

    async fn list_devices_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

fn str_to_const_ifname(name: &str) -> Result<[libc::c_char; libc::IFNAMSIZ]> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        bail!("invalid interface name '{}'", name);
    }

    let mut ifname = [0 as libc::c_char; libc::IFNAMSIZ];
    for (i, c) in name.as_bytes().iter().enumerate() {
        ifname[i] = *c as libc::c_char;
    }
    Ok(ifname)
}

fn control_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        bail!(
            "failed to create socket: {}",
            std::io::Error::last_os_error()
        );
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `NetOps` backed by netlink and tun/bridge ioctls.
pub struct LinuxNetOps {
    nl_connection_task: JoinHandle<()>,
    nl_handle: Handle,
}

impl LinuxNetOps {
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = new_connection()?;
        let nl_connection_task = spawn(connection);

        Ok(Self {
            nl_connection_task,
            nl_handle: handle,
        })
    }

    async fn device_index(&self, name: &str) -> Result<Option<u32>> {
        let mut link = self
            .nl_handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match link.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            _ => Ok(None),
        }
    }
}

impl Drop for LinuxNetOps {
    fn drop(&mut self) {
        self.nl_connection_task.abort();
    }
}

#[async_trait]
impl NetOps for LinuxNetOps {
    async fn device_exists(&self, name: &str) -> Result<bool> {
        Ok(self.device_index(name).await?.is_some())
    }

    async fn delete_device(&self, name: &str) -> Result<bool> {
        let Some(index) = self.device_index(name).await? else {
            return Ok(false);
        };

        self.nl_handle.link().del(index).execute().await?;

        Ok(true)
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        let mut req = libc::ifreq {
            ifr_name: str_to_const_ifname(name)?,
            ifr_ifru: libc::__c_anonymous_ifr_ifru {
                ifru_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as i16,
            },
        };

        let fd = unsafe { libc::open(DEV_NET_TUN, libc::O_RDWR | libc::O_CLOEXEC) };
        if fd == -1 {
            bail!(
                "failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            );
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, std::ptr::addr_of_mut!(req)) }
            != 0
        {
            bail!(
                "failed to set interface name: {}",
                std::io::Error::last_os_error()
            );
        }

        // keep the device around once our fd closes; the hypervisor opens it again
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETPERSIST, 1) } != 0 {
            bail!("failed to set persist: {}", std::io::Error::last_os_error());
        }

        Ok(())
    }

    async fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
        let path = format!("/proc/sys/{}", key.replace('.', "/"));
        tokio::fs::write(&path, value).await?;
        Ok(())
    }

    async fn attach_to_bridge(&self, name: &str, bridge_name: &str) -> Result<()> {
        let Some(index) = self.device_index(name).await? else {
            bail!("device {name} not found");
        };

        let ctrl_fd = control_socket()?;

        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        req.ifr_name = str_to_const_ifname(bridge_name)?;
        req.ifr_ifru.ifru_ifindex = index as i32;

        if unsafe { libc::ioctl(ctrl_fd.as_raw_fd(), SIOCBRADDIF, std::ptr::addr_of_mut!(req)) }
            != 0
        {
            bail!("failed to set master: {}", std::io::Error::last_os_error());
        }

        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        let ctrl_fd = control_socket()?;

        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        req.ifr_name = str_to_const_ifname(name)?;

        if unsafe {
            libc::ioctl(
                ctrl_fd.as_raw_fd(),
                libc::SIOCGIFFLAGS,
                std::ptr::addr_of_mut!(req),
            )
        } != 0
        {
            bail!(
                "failed to get interface flags: {}",
                std::io::Error::last_os_error()
            );
        }

        unsafe { req.ifr_ifru.ifru_flags |= libc::IFF_UP as i16 };

        if unsafe {
            libc::ioctl(
                ctrl_fd.as_raw_fd(),
                libc::SIOCSIFFLAGS,
                std::ptr::addr_of_mut!(req),
            )
        } != 0
        {
            bail!(
                "failed to set interface up: {}",
                std::io::Error::last_os_error()
            );
        }

        Ok(())
    }

    async fn list_devices_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut link = self.nl_handle.link().get().execute();

        let mut devices = Vec::new();
        while let Some(link) = link.try_next().await? {
            let link_name = link.attributes.iter().find(|attr| match attr {
                LinkAttribute::IfName(name) => name.starts_with(prefix),
                _ => false,
            });

            let Some(LinkAttribute::IfName(name)) = link_name else {
                continue;
            };

            devices.push(name.clone());
        }

        Ok(devices)
    }
}
