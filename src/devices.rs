//! Virtual hardware device graph
//!
//! Builds the device-change list for a new VM (SCSI controller, CD-ROM,
//! disk, NIC) and edits the removable media of an existing VM. Nothing here
//! talks to the hypervisor; the results are handed to the task runner.

use serde::{Deserialize, Serialize};

use crate::hypervisor::{DatastoreInfo, DefaultDevice, ManagedRef, NetworkInfo};
use crate::{Error, Result};

pub const SCSI_CONTROLLER_KEY: i32 = 1;
pub const CDROM_KEY: i32 = 20;
pub const DISK_KEY: i32 = 0;
pub const NIC_KEY: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
}

/// One entry of a create or reconfigure request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub operation: Operation,
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl DeviceChange {
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: Operation::Add,
            file_operation: None,
            device,
        }
    }

    pub fn create(device: VirtualDevice) -> Self {
        Self {
            operation: Operation::Add,
            file_operation: Some(FileOperation::Create),
            device,
        }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self {
            operation: Operation::Edit,
            file_operation: None,
            device,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectable {
    pub connected: bool,
    pub start_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub key: i32,
    pub controller_key: Option<i32>,
    pub unit_number: Option<i32>,
    pub connectable: Option<Connectable>,
    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn is_cdrom(&self) -> bool {
        matches!(self.kind, DeviceKind::Cdrom { .. })
    }

    pub fn cdrom_backing(&self) -> Option<&CdromBacking> {
        match &self.kind {
            DeviceKind::Cdrom { backing } => Some(backing),
            _ => None,
        }
    }

    /// Set both the live and the power-on connection state
    pub fn set_connected(&mut self, connected: bool) {
        self.connectable = Some(Connectable {
            connected,
            start_connected: connected,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    ScsiController {
        bus_number: i32,
        shared_bus: SharedBus,
    },
    IdeController,
    Cdrom {
        backing: CdromBacking,
    },
    Disk {
        backing: DiskBacking,
        capacity_kb: u64,
    },
    NetworkAdapter {
        model: NicModel,
        backing: NicBacking,
        address: MacAddress,
    },
    Other {
        type_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharedBus {
    NoSharing,
}

/// Data source behind a virtual CD-ROM. A device has exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CdromBacking {
    /// ISO image, `file_name` is `[datastore] path/to.iso`
    Iso {
        file_name: String,
        datastore: Option<ManagedRef>,
    },
    /// Physical drive on the host
    HostDevice { device_name: String },
    /// Pass-through to the client, no media
    ClientDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdromBackingKind {
    Iso,
    HostDevice,
    ClientDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    Persistent,
    NonPersistent,
    IndependentPersistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBacking {
    pub file_name: String,
    pub disk_mode: DiskMode,
    pub thin_provisioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    E1000,
    Vmxnet2,
    #[default]
    Vmxnet3,
    Pcnet32,
}

impl std::fmt::Display for NicModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NicModel::E1000 => write!(f, "e1000"),
            NicModel::Vmxnet2 => write!(f, "vmxnet2"),
            NicModel::Vmxnet3 => write!(f, "vmxnet3"),
            NicModel::Pcnet32 => write!(f, "pcnet32"),
        }
    }
}

impl std::str::FromStr for NicModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "e1000" => Ok(NicModel::E1000),
            "vmxnet2" => Ok(NicModel::Vmxnet2),
            "vmxnet3" => Ok(NicModel::Vmxnet3),
            "pcnet32" => Ok(NicModel::Pcnet32),
            other => Err(format!("unknown network adapter '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicBacking {
    /// Network name the NIC is bound to
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacAddress {
    Generated,
    Manual(String),
}

/// Construct a CD-ROM backing. `value` is ignored for [`CdromBackingKind::ClientDevice`].
pub fn build_cdrom_backing(kind: CdromBackingKind, value: &str) -> CdromBacking {
    match kind {
        CdromBackingKind::Iso => CdromBacking::Iso {
            file_name: value.to_string(),
            datastore: None,
        },
        CdromBackingKind::HostDevice => CdromBacking::HostDevice {
            device_name: value.to_string(),
        },
        CdromBackingKind::ClientDevice => CdromBacking::ClientDevice,
    }
}

/// Replace the backing of a CD-ROM device in place.
pub fn set_cdrom_backing(device: &mut VirtualDevice, backing: CdromBacking) -> Result<()> {
    match &mut device.kind {
        DeviceKind::Cdrom { backing: current } => {
            *current = backing;
            Ok(())
        }
        other => Err(Error::InvalidDevice(format!(
            "device {} is not a CD-ROM ({:?})",
            device.key, other
        ))),
    }
}

/// `[datastore]`
pub fn volume_name(datastore: &str) -> String {
    format!("[{}]", datastore)
}

/// `[datastore] path/to.iso`
pub fn iso_file_name(datastore: &str, iso_path: &str) -> String {
    format!("{} {}", volume_name(datastore), iso_path)
}

/// Pick the datastore for a new VM: exact name match among accessible
/// datastores, or the first accessible one when no name is given.
pub fn select_datastore<'a>(
    datastores: &'a [DatastoreInfo],
    name: Option<&str>,
) -> Result<&'a DatastoreInfo> {
    datastores
        .iter()
        .filter(|d| d.accessible)
        .find(|d| name.map_or(true, |n| d.name == n))
        .ok_or_else(|| Error::DatastoreNotFound(name.unwrap_or("<any accessible>").to_string()))
}

/// The last accessible network in scan order wins.
pub fn select_network(networks: &[NetworkInfo]) -> Option<&NetworkInfo> {
    networks.iter().filter(|n| n.accessible).last()
}

/// Key of the IDE controller in the default device catalog. The last one listed wins.
pub fn find_ide_controller(defaults: &[DefaultDevice]) -> Option<i32> {
    defaults
        .iter()
        .filter_map(|d| match d {
            DefaultDevice::IdeController { key } => Some(*key),
            DefaultDevice::Other { .. } => None,
        })
        .last()
}

/// Resolved inputs for the creation device list
#[derive(Debug, Clone)]
pub struct CreationContext {
    pub datastore: DatastoreInfo,
    pub network_name: Option<String>,
    pub iso_path: String,
    pub disk_kb: u64,
    pub ide_controller_key: Option<i32>,
    pub nic_model: NicModel,
    pub mac_address: Option<String>,
}

/// Device changes for a new VM, controllers first.
///
/// The CD-ROM is only emitted when an IDE controller was found and the NIC
/// only when a network was found; a missing one is skipped, not an error.
pub fn build_creation_devices(ctx: &CreationContext) -> Vec<DeviceChange> {
    let volume = volume_name(&ctx.datastore.name);
    let mut changes = Vec::with_capacity(4);

    changes.push(DeviceChange::add(VirtualDevice {
        key: SCSI_CONTROLLER_KEY,
        controller_key: None,
        unit_number: None,
        connectable: None,
        kind: DeviceKind::ScsiController {
            bus_number: 0,
            shared_bus: SharedBus::NoSharing,
        },
    }));

    if let Some(ide_key) = ctx.ide_controller_key {
        changes.push(DeviceChange::add(VirtualDevice {
            key: CDROM_KEY,
            controller_key: Some(ide_key),
            unit_number: Some(0),
            connectable: None,
            kind: DeviceKind::Cdrom {
                backing: CdromBacking::Iso {
                    file_name: iso_file_name(&ctx.datastore.name, &ctx.iso_path),
                    datastore: Some(ctx.datastore.reference.clone()),
                },
            },
        }));
    } else {
        tracing::warn!("No IDE controller in the default device catalog, skipping CD-ROM");
    }

    changes.push(DeviceChange::create(VirtualDevice {
        key: DISK_KEY,
        controller_key: Some(SCSI_CONTROLLER_KEY),
        unit_number: Some(0),
        connectable: None,
        kind: DeviceKind::Disk {
            backing: DiskBacking {
                file_name: volume,
                disk_mode: DiskMode::Persistent,
                thin_provisioned: true,
            },
            capacity_kb: ctx.disk_kb,
        },
    }));

    match &ctx.network_name {
        Some(network) => changes.push(DeviceChange::add(VirtualDevice {
            key: NIC_KEY,
            controller_key: None,
            unit_number: None,
            connectable: None,
            kind: DeviceKind::NetworkAdapter {
                model: ctx.nic_model,
                backing: NicBacking {
                    device_name: network.clone(),
                },
                address: match &ctx.mac_address {
                    Some(mac) => MacAddress::Manual(mac.clone()),
                    None => MacAddress::Generated,
                },
            },
        })),
        None => tracing::warn!("No accessible network found, VM will have no NIC"),
    }

    changes
}

/// Edit changes that connect every CD-ROM now and at power-on.
pub fn connect_cdrom_changes(devices: &[VirtualDevice]) -> Vec<DeviceChange> {
    devices
        .iter()
        .filter(|d| d.is_cdrom())
        .map(|d| {
            let mut device = d.clone();
            device.set_connected(true);
            DeviceChange::edit(device)
        })
        .collect()
}

/// Edit changes that disconnect every CD-ROM and drop its media.
pub fn disconnect_cdrom_changes(devices: &[VirtualDevice]) -> Vec<DeviceChange> {
    devices
        .iter()
        .filter(|d| d.is_cdrom())
        .map(|d| {
            let mut device = d.clone();
            device.set_connected(false);
            device.kind = DeviceKind::Cdrom {
                backing: CdromBacking::ClientDevice,
            };
            DeviceChange::edit(device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datastore(name: &str, accessible: bool) -> DatastoreInfo {
        DatastoreInfo {
            name: name.to_string(),
            accessible,
            reference: ManagedRef::new(format!("/dc/datastore/{}", name)),
        }
    }

    fn network(name: &str, accessible: bool) -> NetworkInfo {
        NetworkInfo {
            name: name.to_string(),
            accessible,
        }
    }

    fn context() -> CreationContext {
        CreationContext {
            datastore: datastore("datastore1", true),
            network_name: Some("VM Network".to_string()),
            iso_path: "iso/centos-6.4.iso".to_string(),
            disk_kb: 41943040,
            ide_controller_key: Some(200),
            nic_model: NicModel::Pcnet32,
            mac_address: None,
        }
    }

    fn cdrom(key: i32, backing: CdromBacking) -> VirtualDevice {
        VirtualDevice {
            key,
            controller_key: Some(200),
            unit_number: Some(0),
            connectable: Some(Connectable {
                connected: false,
                start_connected: false,
            }),
            kind: DeviceKind::Cdrom { backing },
        }
    }

    #[test]
    fn test_full_device_graph_order() {
        let changes = build_creation_devices(&context());
        assert_eq!(changes.len(), 4);

        assert!(matches!(changes[0].device.kind, DeviceKind::ScsiController { bus_number: 0, .. }));
        assert_eq!(changes[0].operation, Operation::Add);

        assert!(changes[1].device.is_cdrom());
        assert_eq!(changes[1].device.controller_key, Some(200));
        match changes[1].device.cdrom_backing() {
            Some(CdromBacking::Iso { file_name, .. }) => {
                assert_eq!(file_name, "[datastore1] iso/centos-6.4.iso")
            }
            other => panic!("unexpected backing: {:?}", other),
        }

        assert_eq!(changes[2].file_operation, Some(FileOperation::Create));
        assert_eq!(changes[2].device.controller_key, Some(SCSI_CONTROLLER_KEY));
        match &changes[2].device.kind {
            DeviceKind::Disk { backing, capacity_kb } => {
                assert_eq!(*capacity_kb, 41943040);
                assert!(backing.thin_provisioned);
                assert_eq!(backing.disk_mode, DiskMode::Persistent);
                assert_eq!(backing.file_name, "[datastore1]");
            }
            other => panic!("unexpected device: {:?}", other),
        }

        match &changes[3].device.kind {
            DeviceKind::NetworkAdapter { backing, address, model } => {
                assert_eq!(backing.device_name, "VM Network");
                assert_eq!(*address, MacAddress::Generated);
                assert_eq!(*model, NicModel::Pcnet32);
            }
            other => panic!("unexpected device: {:?}", other),
        }
    }

    #[test]
    fn test_no_ide_controller_skips_cdrom() {
        let mut ctx = context();
        ctx.ide_controller_key = find_ide_controller(&[DefaultDevice::Other {
            type_name: "VirtualPS2Controller".into(),
            key: 300,
        }]);

        let changes = build_creation_devices(&ctx);
        assert_eq!(changes.len(), 3);
        assert!(!changes.iter().any(|c| c.device.is_cdrom()));
    }

    #[test]
    fn test_no_network_skips_nic() {
        let mut ctx = context();
        ctx.network_name = select_network(&[]).map(|n| n.name.clone());

        let changes = build_creation_devices(&ctx);
        assert!(!changes
            .iter()
            .any(|c| matches!(c.device.kind, DeviceKind::NetworkAdapter { .. })));
    }

    #[test]
    fn test_manual_mac_address() {
        let mut ctx = context();
        ctx.mac_address = Some("00:50:56:aa:bb:cc".to_string());

        let changes = build_creation_devices(&ctx);
        let nic = changes.last().unwrap();
        assert!(matches!(
            &nic.device.kind,
            DeviceKind::NetworkAdapter { address: MacAddress::Manual(mac), .. }
                if mac == "00:50:56:aa:bb:cc"
        ));
    }

    #[test]
    fn test_last_accessible_network_wins() {
        let networks = vec![
            network("VM Network", true),
            network("VM Network 2", true),
            network("Isolated", false),
        ];
        assert_eq!(select_network(&networks).unwrap().name, "VM Network 2");
        assert!(select_network(&[network("down", false)]).is_none());
    }

    #[test]
    fn test_last_ide_controller_wins() {
        let defaults = vec![
            DefaultDevice::IdeController { key: 200 },
            DefaultDevice::Other { type_name: "VirtualPCIController".into(), key: 100 },
            DefaultDevice::IdeController { key: 201 },
        ];
        assert_eq!(find_ide_controller(&defaults), Some(201));
    }

    #[test]
    fn test_select_datastore() {
        let stores = vec![
            datastore("offline", false),
            datastore("datastore1", true),
            datastore("datastore2", true),
        ];

        assert_eq!(select_datastore(&stores, None).unwrap().name, "datastore1");
        assert_eq!(select_datastore(&stores, Some("datastore2")).unwrap().name, "datastore2");
        assert!(matches!(
            select_datastore(&stores, Some("offline")),
            Err(Error::DatastoreNotFound(_))
        ));
        assert!(matches!(
            select_datastore(&stores, Some("datastore")),
            Err(Error::DatastoreNotFound(_))
        ));
    }

    #[test]
    fn test_build_cdrom_backing_variants() {
        assert_eq!(
            build_cdrom_backing(CdromBackingKind::Iso, "[ds] a.iso"),
            CdromBacking::Iso { file_name: "[ds] a.iso".into(), datastore: None }
        );
        assert_eq!(
            build_cdrom_backing(CdromBackingKind::HostDevice, "/dev/cdrom"),
            CdromBacking::HostDevice { device_name: "/dev/cdrom".into() }
        );
        assert_eq!(
            build_cdrom_backing(CdromBackingKind::ClientDevice, "ignored"),
            CdromBacking::ClientDevice
        );
    }

    #[test]
    fn test_set_cdrom_backing_is_idempotent() {
        let backing = build_cdrom_backing(CdromBackingKind::Iso, "[ds] a.iso");
        let mut once = cdrom(3000, CdromBacking::ClientDevice);
        set_cdrom_backing(&mut once, backing.clone()).unwrap();

        let mut twice = once.clone();
        set_cdrom_backing(&mut twice, backing).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_set_cdrom_backing_replaces_not_merges() {
        let mut dev = cdrom(3000, CdromBacking::HostDevice { device_name: "/dev/sr0".into() });
        set_cdrom_backing(&mut dev, CdromBacking::ClientDevice).unwrap();
        assert_eq!(dev.cdrom_backing(), Some(&CdromBacking::ClientDevice));
    }

    #[test]
    fn test_set_cdrom_backing_rejects_other_devices() {
        let mut disk = build_creation_devices(&context()).remove(2).device;
        let result = set_cdrom_backing(&mut disk, CdromBacking::ClientDevice);
        assert!(matches!(result, Err(Error::InvalidDevice(_))));
    }

    #[test]
    fn test_connect_and_disconnect_changes() {
        let devices = vec![
            cdrom(3000, CdromBacking::Iso { file_name: "[ds] a.iso".into(), datastore: None }),
            VirtualDevice {
                key: 200,
                controller_key: None,
                unit_number: None,
                connectable: None,
                kind: DeviceKind::IdeController,
            },
            cdrom(3001, CdromBacking::ClientDevice),
        ];

        let connect = connect_cdrom_changes(&devices);
        assert_eq!(connect.len(), 2);
        for change in &connect {
            assert_eq!(change.operation, Operation::Edit);
            assert_eq!(
                change.device.connectable,
                Some(Connectable { connected: true, start_connected: true })
            );
        }
        assert!(matches!(connect[0].device.cdrom_backing(), Some(CdromBacking::Iso { .. })));

        let disconnect = disconnect_cdrom_changes(&devices);
        assert_eq!(disconnect.len(), 2);
        for change in &disconnect {
            assert_eq!(change.device.cdrom_backing(), Some(&CdromBacking::ClientDevice));
            assert_eq!(
                change.device.connectable,
                Some(Connectable { connected: false, start_connected: false })
            );
        }

        assert!(connect_cdrom_changes(&devices[1..2]).is_empty());
    }

    #[test]
    fn test_nic_model_parsing() {
        assert_eq!("VMXNET3".parse::<NicModel>(), Ok(NicModel::Vmxnet3));
        assert_eq!(NicModel::E1000.to_string(), "e1000");
        assert!("rtl8139".parse::<NicModel>().is_err());
    }
}
