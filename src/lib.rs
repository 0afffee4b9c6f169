//! VM lifecycle management on vSphere
//!
//! Creates VMs (from raw hardware specs or by cloning a template) that boot
//! from an installer ISO, watches the installation until the guest reports
//! completion, then either records the VM's IP address or installs a network
//! fix-up daemon, powers the VM off and ejects its media. VMs are deleted the
//! same way they are created: through a [`Session`] on a [`Hypervisor`].
//!
//! The shipped hypervisor is [`GovcClient`], which drives the `govc` CLI.
//! Every wait goes through a [`Poller`], so tests swap in a
//! [`SimulatedClock`](poll::SimulatedClock) and run instantly.
//!
//! # Example
//!
//! ```no_run
//! use vm_mgmt::{
//!     CreateRequest, GovcClient, InstallWatchConfig, InstallWatcher, Poller, Session, SystemClock,
//!     VmCreator,
//! };
//! use vm_mgmt::models::{EndpointCredentials, GuestCredentials};
//!
//! let govc = GovcClient::new("govc").insecure(true);
//! let session = Session::open(&govc, "10.0.0.2", &EndpointCredentials::new("admin", "secret"))?;
//! let clock = SystemClock::new();
//!
//! let request = CreateRequest::builder()
//!     .name("build-01")
//!     .datacenter("dc1")
//!     .host("esx-01.lab")
//!     .iso("iso/installer.iso")
//!     .build_validated()?;
//! VmCreator::new(&*session, Poller::new(&clock)).create(&request)?;
//!
//! let watch = InstallWatchConfig::builder()
//!     .vm_name("build-01")
//!     .credentials(GuestCredentials::new("root", "changeme"))
//!     .capture_ip("/tmp")
//!     .build_validated()?;
//! let report = InstallWatcher::new(&*session, Poller::new(&clock)).run(&watch)?;
//! println!("{:?}", report.ip_address);
//! # Ok::<(), vm_mgmt::Error>(())
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod govc;
pub mod hypervisor;
pub mod logging;
pub mod models;
pub mod poll;
pub mod task;
pub mod workflow;

pub use config::{CreateRequest, InstallWatchConfig, Settings};
pub use error::{Error, ErrorKind, Result};
pub use govc::GovcClient;
pub use hypervisor::{Hypervisor, Session};
pub use poll::{Poller, SystemClock};
pub use workflow::{InstallWatcher, VmCreator, VmDeleter};
