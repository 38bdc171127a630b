use crate::callbacks::{acked, SlotStatusEvent, SlotStatusHandler};
use crate::error::{HalError, Missing, Precondition};
use derive_more::Display;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FormFactor {
    #[display("1FF")]
    Ff1 = 0,
    #[display("2FF")]
    Ff2,
    #[display("3FF")]
    Ff3,
    #[default]
    #[display("4FF")]
    Ff4,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UiccApplication {
    #[default]
    #[display("USIM")]
    Usim = 0,
    #[display("ISIM")]
    Isim,
    #[display("eSIM")]
    Esim,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CardStatus {
    Valid = 0,
    Blocked,
    Error,
    #[default]
    Empty,
}

impl CardStatus {
    /// Blocked, errored and empty cards stay unusable until a card insertion.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CardStatus::Valid)
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SlotStatus {
    #[default]
    NotReady = 1,
    Selecting,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UiccSlot {
    pub index: u32,
    pub slot_enabled: bool,
    pub card_present: bool,
    pub card_enabled: bool,
    pub form_factor: FormFactor,
    pub application: UiccApplication,
    pub status: CardStatus,
    pub mno_name: String,
    pub iccid: String,
    pub msisdn: String,
    /// Selection state of this slot, `NotReady` for every slot but the
    /// selected one.
    pub selection: SlotStatus,
}

impl UiccSlot {
    pub fn is_usable(&self) -> bool {
        self.slot_enabled && self.card_present && self.card_enabled && !self.status.is_terminal()
    }
}

#[derive(Default)]
pub(crate) struct UiccManager {
    slots: Vec<UiccSlot>,
    selected: Option<u32>,
    status: SlotStatus,
    handler: Option<Arc<dyn SlotStatusHandler>>,
}

impl UiccManager {
    pub fn slots(&self) -> &[UiccSlot] {
        &self.slots
    }

    pub fn slot(&self, index: u32) -> Option<&UiccSlot> {
        self.slots.iter().find(|s| s.index == index)
    }

    pub fn selected(&self) -> Option<u32> {
        self.selected
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == SlotStatus::Ready
    }

    pub fn set_slots(&mut self, mut slots: Vec<UiccSlot>) {
        slots.sort_by_key(|s| s.index);
        self.slots = slots;
        self.stamp_selection();
    }

    /// Picks the slot to activate: the preferred one when usable, otherwise
    /// the first usable slot.
    pub fn choose(&self, preferred: Option<u32>) -> Result<u32, HalError> {
        if let Some(index) = preferred {
            match self.slot(index) {
                Some(slot) if slot.is_usable() => return Ok(index),
                Some(_) => warn!(slot = index, "preferred slot is not usable"),
                None => return Err(HalError::NotFound(Missing::Slot(index))),
            }
        }

        self.slots
            .iter()
            .find(|s| s.is_usable())
            .map(|s| s.index)
            .ok_or(HalError::PreconditionNotMet(Precondition::NoUsableCard))
    }

    pub fn begin_select(&mut self, handler: Arc<dyn SlotStatusHandler>) {
        self.handler = Some(handler);
        self.selected = None;
        self.status = SlotStatus::Selecting;
        self.stamp_selection();
        self.notify(String::new(), String::new(), None);
    }

    pub fn selecting(&mut self, index: u32) {
        self.selected = Some(index);
        self.status = SlotStatus::Selecting;
        self.stamp_selection();
    }

    pub fn select_succeeded(&mut self, index: u32, slot_name: String, slot_type: String) {
        info!(slot = index, %slot_name, %slot_type, "uicc slot ready");
        self.selected = Some(index);
        self.status = SlotStatus::Ready;
        self.stamp_selection();
        self.notify(slot_name, slot_type, None);
    }

    pub fn select_failed(&mut self, error: HalError) {
        warn!(%error, "uicc slot selection failed");
        self.selected = None;
        self.status = SlotStatus::NotReady;
        self.stamp_selection();
        self.notify(String::new(), String::new(), Some(error));
    }

    /// Applies a card status indication. Returns true if the selected slot
    /// just became unusable.
    pub fn card_status(&mut self, index: u32, status: CardStatus) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.index == index) {
            slot.status = status;
            slot.card_present = status != CardStatus::Empty;
        }

        let lost = self.selected == Some(index)
            && self.status != SlotStatus::NotReady
            && status.is_terminal();

        if lost {
            warn!(slot = index, %status, "selected card is no longer usable");
            self.status = SlotStatus::NotReady;
            self.notify(
                String::new(),
                String::new(),
                Some(HalError::PreconditionNotMet(Precondition::NoUsableCard)),
            );
        }

        self.stamp_selection();
        lost
    }

    /// Drops readiness when the selected slot stopped holding a usable card,
    /// e.g. after a refresh. Returns true if readiness was lost.
    pub fn revalidate(&mut self) -> bool {
        let Some(index) = self.selected else {
            return false;
        };

        if self.status != SlotStatus::Ready
            || self.slot(index).is_some_and(UiccSlot::is_usable)
        {
            return false;
        }

        warn!(slot = index, "selected slot no longer holds a usable card");
        self.status = SlotStatus::NotReady;
        self.stamp_selection();
        self.notify(
            String::new(),
            String::new(),
            Some(HalError::PreconditionNotMet(Precondition::NoUsableCard)),
        );

        true
    }

    /// Applies a card insertion. Returns true if selection should run again.
    pub fn card_inserted(&mut self, index: u32) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.index == index) {
            slot.card_present = true;
        }

        self.handler.is_some() && self.status == SlotStatus::NotReady
    }

    pub fn handler(&self) -> Option<Arc<dyn SlotStatusHandler>> {
        self.handler.clone()
    }

    /// Forces `NotReady` after the device went away and forgets cached slots.
    pub fn reset(&mut self) {
        if self.status != SlotStatus::NotReady {
            self.status = SlotStatus::NotReady;
            self.notify(String::new(), String::new(), Some(HalError::DeviceAbsent));
        }

        self.slots.clear();
        self.selected = None;
        self.handler = None;
    }

    fn stamp_selection(&mut self) {
        for slot in &mut self.slots {
            slot.selection = if Some(slot.index) == self.selected {
                self.status
            } else {
                SlotStatus::NotReady
            };
        }
    }

    fn notify(&self, slot_name: String, slot_type: String, error: Option<HalError>) {
        if let Some(handler) = &self.handler {
            acked(
                "slot-status",
                handler.on_slot_status(SlotStatusEvent {
                    slot_name,
                    slot_type,
                    slot_num: self.selected,
                    status: self.status,
                    error,
                }),
            );
        }
    }
}
