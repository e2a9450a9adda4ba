pub const DEFAULT_BOOT_ARGS: &str =
    "ro console=ttyS0 noapic reboot=k panic=1 pci=off nomodules random.trust_cpu=on";

pub const DEFAULT_BRIDGE_NAME: &str = "docker0";
pub const DEFAULT_SUBNET_CIDR: &str = "172.17.0.0/24";
pub const DEFAULT_FIRST_ORDINAL: u8 = 4;
pub const DEFAULT_LAST_ORDINAL: u8 = 254;
pub const DEFAULT_TAP_PREFIX: &str = "fc-tap-";

pub const DEFAULT_VCPU_COUNT: u8 = 1;
pub const DEFAULT_MEMORY_MIB: u64 = 512;
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

pub const GUEST_IFACE_ID: &str = "eth0";
pub const ROOT_DRIVE_ID: &str = "rootfs";
pub const MAC_PREFIX: &str = "02:FC:00:00:00";
