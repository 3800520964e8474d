//! Outer-ring adapters: everything that talks to hardware, flash, or the
//! network on the device's behalf. Domain logic in `tasks` never imports
//! `esp_idf_svc`/`esp_idf_sys` directly — it goes through these traits.

pub mod http;
pub mod nvs;
pub mod wifi;
