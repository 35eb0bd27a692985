//! Registry bootstrap: bind the globals this client understands
//!
//! The server advertises its globals during the initial round-trip. Each
//! advertisement is matched by interface name against [`Interface`]; known
//! interfaces are bound once, at the highest version both sides support. After
//! the round-trip [`GlobalRegistry::require`] gates startup on the required
//! subset. Optional globals only disable the features built on them.

use crate::error::StartupError;
use crate::protocol::{Display, Global, ObjectId};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Interfaces the client knows how to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Compositor,
    Shm,
    WmBase,
    Seat,
    Exporter,
    Importer,
}

impl Interface {
    pub const ALL: [Interface; 6] = [
        Interface::Compositor,
        Interface::Shm,
        Interface::WmBase,
        Interface::Seat,
        Interface::Exporter,
        Interface::Importer,
    ];

    /// Protocol interface name
    pub fn name(&self) -> &'static str {
        match self {
            Interface::Compositor => "wl_compositor",
            Interface::Shm => "wl_shm",
            Interface::WmBase => "xdg_wm_base",
            Interface::Seat => "wl_seat",
            Interface::Exporter => "zxdg_exporter_v2",
            Interface::Importer => "zxdg_importer_v2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.name() == name)
    }

    /// Oldest version the client code works with
    pub fn min_version(&self) -> u32 {
        match self {
            // damage_buffer needs wl_surface v4
            Interface::Compositor => 4,
            _ => 1,
        }
    }

    /// Newest version the client code knows about
    pub fn max_version(&self) -> u32 {
        match self {
            Interface::Compositor => 4,
            Interface::Shm => 1,
            Interface::WmBase => 1,
            // v3 adds wl_keyboard.release / wl_pointer.release
            Interface::Seat => 3,
            Interface::Exporter | Interface::Importer => 1,
        }
    }

    /// Required globals abort startup when missing
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            Interface::Compositor | Interface::Shm | Interface::WmBase
        )
    }
}

/// A bound global
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundGlobal {
    pub name: u32,
    pub version: u32,
    pub id: ObjectId,
}

/// Globals bound during bootstrap
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    bound: HashMap<Interface, BoundGlobal>,
    /// Advertised but unusable (version too old)
    too_old: HashMap<Interface, u32>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every recognized advertisement
    pub fn bind_all(
        &mut self,
        display: &mut dyn Display,
        globals: &[Global],
    ) -> Result<(), StartupError> {
        for global in globals {
            let Some(interface) = Interface::from_name(&global.interface) else {
                debug!(
                    "Ignoring global {} {} v{}",
                    global.name, global.interface, global.version
                );
                continue;
            };

            if self.bound.contains_key(&interface) {
                debug!(
                    "{} already bound, ignoring duplicate global {}",
                    interface.name(),
                    global.name
                );
                continue;
            }

            if global.version < interface.min_version() {
                warn!(
                    "{} v{} is older than the required v{}",
                    interface.name(),
                    global.version,
                    interface.min_version()
                );
                self.too_old.insert(interface, global.version);
                continue;
            }

            let version = global.version.min(interface.max_version());
            let id = display.bind(global, version)?;
            debug!(
                "Bound {} (global {}) at v{} as {}",
                interface.name(),
                global.name,
                version,
                id
            );
            self.too_old.remove(&interface);
            self.bound.insert(
                interface,
                BoundGlobal {
                    name: global.name,
                    version,
                    id,
                },
            );
        }

        info!(
            "🔗 Bound {} globals: {}",
            self.bound.len(),
            Interface::ALL
                .iter()
                .filter(|i| self.bound.contains_key(i))
                .map(|i| i.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Fail unless every required interface is bound
    pub fn require(&self) -> Result<(), StartupError> {
        for interface in Interface::ALL.iter().filter(|i| i.is_required()) {
            if self.bound.contains_key(interface) {
                continue;
            }
            if let Some(&advertised) = self.too_old.get(interface) {
                return Err(StartupError::GlobalTooOld {
                    interface: interface.name(),
                    advertised,
                    required: interface.min_version(),
                });
            }
            return Err(StartupError::MissingGlobal {
                interface: interface.name(),
            });
        }
        Ok(())
    }

    pub fn get(&self, interface: Interface) -> Option<ObjectId> {
        self.bound.get(&interface).map(|g| g.id)
    }

    pub fn bound(&self, interface: Interface) -> Option<&BoundGlobal> {
        self.bound.get(&interface)
    }

    /// Id of a required global. Only valid after [`GlobalRegistry::require`] passed.
    pub fn required(&self, interface: Interface) -> Result<ObjectId, StartupError> {
        self.get(interface).ok_or(StartupError::MissingGlobal {
            interface: interface.name(),
        })
    }

    /// The server withdrew a global. Only logged; this client has no policy
    /// for losing a global at runtime.
    pub fn global_removed(&mut self, name: u32) {
        match self.bound.iter().find(|(_, g)| g.name == name) {
            Some((interface, _)) => warn!(
                "Global {} ({}) was removed by the compositor",
                name,
                interface.name()
            ),
            None => debug!("Global {} removed", name),
        }
    }

    /// Destroy bound globals. Seat, importer and exporter go first.
    pub fn destroy(&mut self, display: &mut dyn Display) {
        let order = [
            Interface::Seat,
            Interface::Importer,
            Interface::Exporter,
            Interface::WmBase,
            Interface::Shm,
            Interface::Compositor,
        ];
        for interface in order {
            if let Some(global) = self.bound.remove(&interface) {
                display.destroy(global.id);
            }
        }
    }
}
