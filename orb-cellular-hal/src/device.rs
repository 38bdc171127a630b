use crate::callbacks::{
    acked, DeviceOpened, DeviceOpenedHandler, DeviceRemoved, DeviceRemovedHandler,
};
use crate::error::HalError;
use derive_more::Display;
use std::sync::Arc;
use tracing::info;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    NotPresent,
    Detected,
    Opening,
    Ready,
    Removed,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperatingMode {
    #[default]
    Online = 1,
    Offline,
    LowPower,
    Reset,
    FactoryReset,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceOpenStatus {
    NotReady = 1,
    InProgress,
    Ready,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DetectionStatus {
    Detected = 1,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemDevice {
    pub name: String,
    pub wan_ifname: String,
    pub control_opened: bool,
    pub mode: OperatingMode,
}

/// Presence, open state and the two device-level handlers.
#[derive(Default)]
pub(crate) struct DeviceManager {
    state: DeviceState,
    device: Option<ModemDevice>,
    opened_handler: Option<Arc<dyn DeviceOpenedHandler>>,
    removed_handler: Option<Arc<dyn DeviceRemovedHandler>>,
}

impl DeviceManager {
    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn device(&self) -> Option<&ModemDevice> {
        self.device.as_ref()
    }

    pub fn name(&self) -> String {
        self.device
            .as_ref()
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Ready
    }

    /// Handlers registered by the last open, if any.
    pub fn handlers(
        &self,
    ) -> Option<(Arc<dyn DeviceOpenedHandler>, Arc<dyn DeviceRemovedHandler>)> {
        Some((self.opened_handler.clone()?, self.removed_handler.clone()?))
    }

    pub fn detected(&mut self) {
        if self.state == DeviceState::NotPresent {
            info!("modem detected");
            self.state = DeviceState::Detected;
        }
    }

    pub fn begin_open(
        &mut self,
        opened: Arc<dyn DeviceOpenedHandler>,
        removed: Arc<dyn DeviceRemovedHandler>,
    ) {
        self.opened_handler = Some(opened);
        self.removed_handler = Some(removed);
        self.state = DeviceState::Opening;
        self.notify_opened(DeviceOpenStatus::InProgress, None);
    }

    pub fn open_succeeded(
        &mut self,
        device_name: String,
        wan_ifname: String,
        mode: OperatingMode,
    ) {
        info!(%device_name, %wan_ifname, %mode, "modem control interface opened");
        self.device = Some(ModemDevice {
            name: device_name,
            wan_ifname,
            control_opened: true,
            mode,
        });
        self.state = DeviceState::Ready;
        self.notify_opened(DeviceOpenStatus::Ready, None);
    }

    pub fn open_failed(&mut self, error: HalError) {
        self.device = None;
        // A cancelled open means the device went away, removal handles the rest.
        if self.state == DeviceState::Opening {
            self.state = DeviceState::Detected;
        }
        self.notify_opened(DeviceOpenStatus::NotReady, Some(error));
    }

    pub fn mode_changed(&mut self, mode: OperatingMode) {
        if let Some(device) = self.device.as_mut() {
            device.mode = mode;
        }
        self.notify_opened(self.open_status(), None);
    }

    pub fn mode_change_failed(&self, error: HalError) {
        self.notify_opened(self.open_status(), Some(error));
    }

    /// Transitions through `Removed` back to `NotPresent`, reports the removal
    /// and forgets the handlers registered by the last open.
    pub fn removed(&mut self) {
        let device_name = self.name();
        info!(%device_name, previous = %self.state, "modem removed");
        self.state = DeviceState::Removed;
        self.device = None;

        if let Some(handler) = self.removed_handler.take() {
            acked(
                "device-removed",
                handler.on_device_removed(DeviceRemoved {
                    device_name,
                    status: DetectionStatus::Removed,
                }),
            );
        }

        self.opened_handler = None;
        self.state = DeviceState::NotPresent;
    }

    /// Drops the open state without reporting anything, used on shutdown.
    pub fn closed(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.control_opened = false;
        }
        if self.state == DeviceState::Ready {
            self.state = DeviceState::Detected;
        }
        self.opened_handler = None;
        self.removed_handler = None;
    }

    fn open_status(&self) -> DeviceOpenStatus {
        match self.state {
            DeviceState::Ready => DeviceOpenStatus::Ready,
            DeviceState::Opening => DeviceOpenStatus::InProgress,
            _ => DeviceOpenStatus::NotReady,
        }
    }

    fn notify_opened(&self, status: DeviceOpenStatus, error: Option<HalError>) {
        let Some(handler) = &self.opened_handler else {
            return;
        };

        let (device_name, wan_ifname, mode) = match &self.device {
            Some(d) => (d.name.clone(), d.wan_ifname.clone(), d.mode),
            None => (String::new(), String::new(), OperatingMode::default()),
        };

        acked(
            "device-opened",
            handler.on_device_opened(DeviceOpened {
                device_name,
                wan_ifname,
                status,
                mode,
                error,
            }),
        );
    }
}
