//! Windows Filtering Platform backend
//!
//! Thin wrappers over the `Fwpm*` user-mode API. Each method is one native
//! call; native memory handed back by the engine (provider and sublayer
//! lookups, enumeration batches, app-id blobs) is freed by RAII guards
//! before or when the value leaves this module.
//!
//! On other platforms [`WfpBackend::open_session`] fails with
//! [`FilterError::NotSupported`](crate::error::FilterError::NotSupported).

#[cfg(windows)]
pub use native::{AppIdBlob, WfpBackend, WfpSession};

#[cfg(not(windows))]
pub use unsupported::{WfpBackend, WfpSession};

#[cfg(windows)]
mod native {
    use super::super::marshal::{from_guid, to_guid, wide, FilterArena};
    use super::super::{BackendSession, FilterBackend, FilterRecord};
    use crate::builder::FilterPlan;
    use crate::error::{FilterError, FilterResult};
    use crate::identity::{ProviderSpec, SublayerSpec};
    use crate::status::NativeStatus;
    use std::ffi::c_void;
    use std::ptr;
    use uuid::Uuid;
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::NetworkManagement::WindowsFilteringPlatform::*;
    use windows::Win32::System::Rpc::RPC_C_AUTHN_WINNT;

    /// Free memory the engine allocated on our behalf
    unsafe fn free_native<T>(ptr: *mut T) {
        if !ptr.is_null() {
            FwpmFreeMemory0(&mut (ptr as *mut c_void));
        }
    }

    /// Base Filtering Engine on the local machine
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WfpBackend;

    impl WfpBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl FilterBackend for WfpBackend {
        type Session = WfpSession;

        fn open_session(&self) -> FilterResult<WfpSession> {
            let mut handle = HANDLE::default();

            let result = unsafe {
                FwpmEngineOpen0(
                    PCWSTR::null(),
                    RPC_C_AUTHN_WINNT,
                    None,
                    None,
                    &mut handle,
                )
            };

            NativeStatus::check(result)
                .map_err(|status| FilterError::native("FwpmEngineOpen0", status))?;

            log::debug!("WFP engine session opened");
            Ok(WfpSession { handle })
        }
    }

    /// Open engine handle, closed on drop
    pub struct WfpSession {
        handle: HANDLE,
    }

    // Engine handles may be used from any thread; one session is never used
    // from two threads at once.
    unsafe impl Send for WfpSession {}

    impl Drop for WfpSession {
        fn drop(&mut self) {
            if self.handle.is_invalid() {
                return;
            }
            let result = unsafe { FwpmEngineClose0(self.handle) };
            if let Err(status) = NativeStatus::check(result) {
                log::warn!("FwpmEngineClose0 failed: {}", status);
            }
            self.handle = HANDLE::default();
            log::debug!("WFP engine session closed");
        }
    }

    /// App-id blob from `FwpmGetAppIdFromFileName0`, freed on drop
    pub struct AppIdBlob {
        blob: *mut FWP_BYTE_BLOB,
    }

    impl Drop for AppIdBlob {
        fn drop(&mut self) {
            unsafe { free_native(self.blob) };
            self.blob = ptr::null_mut();
        }
    }

    /// One `FwpmFilterEnum0` batch, freed on drop
    struct FilterBatch {
        entries: *mut *mut FWPM_FILTER0,
        count: usize,
    }

    impl FilterBatch {
        fn records(&self) -> Vec<FilterRecord> {
            if self.entries.is_null() {
                return Vec::new();
            }
            (0..self.count)
                .filter_map(|i| unsafe {
                    let filter = *self.entries.add(i);
                    if filter.is_null() {
                        return None;
                    }
                    let filter = &*filter;
                    Some(FilterRecord {
                        filter_key: from_guid(&filter.filterKey),
                        filter_id: filter.filterId,
                        sublayer_key: from_guid(&filter.subLayerKey),
                        display_name: read_wide(filter.displayData.name),
                    })
                })
                .collect()
        }
    }

    impl Drop for FilterBatch {
        fn drop(&mut self) {
            unsafe { free_native(self.entries) };
            self.entries = ptr::null_mut();
        }
    }

    fn read_wide(value: PWSTR) -> String {
        if value.is_null() {
            return String::new();
        }
        unsafe { value.to_string() }.unwrap_or_default()
    }

    impl BackendSession for WfpSession {
        type Cursor = HANDLE;
        type AppId = AppIdBlob;

        fn begin_transaction(&self) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmTransactionBegin0(self.handle, 0) })
        }

        fn commit_transaction(&self) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmTransactionCommit0(self.handle) })
        }

        fn abort_transaction(&self) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmTransactionAbort0(self.handle) })
        }

        fn get_provider(&self, key: &Uuid) -> Result<(), NativeStatus> {
            let mut provider: *mut FWPM_PROVIDER0 = ptr::null_mut();
            let result =
                unsafe { FwpmProviderGetByKey0(self.handle, &to_guid(key), &mut provider) };
            unsafe { free_native(provider) };
            NativeStatus::check(result)
        }

        fn add_provider(&self, spec: &ProviderSpec) -> Result<(), NativeStatus> {
            let mut name = wide(&spec.name);
            let mut description = wide(&spec.description);

            let provider = FWPM_PROVIDER0 {
                providerKey: to_guid(&spec.key),
                displayData: FWPM_DISPLAY_DATA0 {
                    name: PWSTR::from_raw(name.as_mut_ptr()),
                    description: PWSTR::from_raw(description.as_mut_ptr()),
                },
                flags: if spec.persistent { FWPM_PROVIDER_FLAG_PERSISTENT } else { 0 },
                providerData: FWP_BYTE_BLOB::default(),
                serviceName: PWSTR::null(),
            };

            NativeStatus::check(unsafe { FwpmProviderAdd0(self.handle, &provider, None) })
        }

        fn delete_provider(&self, key: &Uuid) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmProviderDeleteByKey0(self.handle, &to_guid(key)) })
        }

        fn get_sublayer(&self, key: &Uuid) -> Result<(), NativeStatus> {
            let mut sublayer: *mut FWPM_SUBLAYER0 = ptr::null_mut();
            let result =
                unsafe { FwpmSubLayerGetByKey0(self.handle, &to_guid(key), &mut sublayer) };
            unsafe { free_native(sublayer) };
            NativeStatus::check(result)
        }

        fn add_sublayer(&self, spec: &SublayerSpec) -> Result<(), NativeStatus> {
            let mut name = wide(&spec.name);
            let mut description = wide(&spec.description);
            let mut provider_key = to_guid(&spec.provider_key);

            let sublayer = FWPM_SUBLAYER0 {
                subLayerKey: to_guid(&spec.key),
                displayData: FWPM_DISPLAY_DATA0 {
                    name: PWSTR::from_raw(name.as_mut_ptr()),
                    description: PWSTR::from_raw(description.as_mut_ptr()),
                },
                flags: if spec.persistent { FWPM_SUBLAYER_FLAG_PERSISTENT } else { 0 },
                providerKey: &mut provider_key as *mut _,
                providerData: FWP_BYTE_BLOB::default(),
                weight: spec.weight,
            };

            NativeStatus::check(unsafe { FwpmSubLayerAdd0(self.handle, &sublayer, None) })
        }

        fn delete_sublayer(&self, key: &Uuid) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmSubLayerDeleteByKey0(self.handle, &to_guid(key)) })
        }

        fn create_filter_enum(&self) -> Result<HANDLE, NativeStatus> {
            let mut cursor = HANDLE::default();
            NativeStatus::check(unsafe {
                FwpmFilterCreateEnumHandle0(self.handle, None, &mut cursor)
            })?;
            Ok(cursor)
        }

        fn fetch_filters(
            &self,
            cursor: HANDLE,
            max_entries: u32,
        ) -> Result<Vec<FilterRecord>, NativeStatus> {
            let mut entries: *mut *mut FWPM_FILTER0 = ptr::null_mut();
            let mut returned: u32 = 0;

            let result = unsafe {
                FwpmFilterEnum0(self.handle, cursor, max_entries, &mut entries, &mut returned)
            };

            let batch = FilterBatch {
                entries,
                count: returned as usize,
            };
            NativeStatus::check(result)?;
            Ok(batch.records())
        }

        fn destroy_filter_enum(&self, cursor: HANDLE) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmFilterDestroyEnumHandle0(self.handle, cursor) })
        }

        fn resolve_app_id(&self, path: &str) -> Result<AppIdBlob, NativeStatus> {
            let path_wide = wide(path);
            let mut blob: *mut FWP_BYTE_BLOB = ptr::null_mut();

            let result = unsafe {
                FwpmGetAppIdFromFileName0(PCWSTR::from_raw(path_wide.as_ptr()), &mut blob)
            };

            let app_id = AppIdBlob { blob };
            NativeStatus::check(result)?;
            if app_id.blob.is_null() {
                return Err(NativeStatus(crate::status::ERROR_FILE_NOT_FOUND));
            }
            Ok(app_id)
        }

        fn add_filter(
            &self,
            plan: &FilterPlan,
            app_id: Option<&AppIdBlob>,
        ) -> Result<u64, NativeStatus> {
            let mut arena = FilterArena::new(plan, app_id.map(|a| a.blob));
            if arena.condition_count() != plan.conditions.len() {
                return Err(NativeStatus(crate::status::ERROR_INVALID_PARAMETER));
            }
            let native = arena.native();

            let mut filter_id: u64 = 0;
            let result =
                unsafe { FwpmFilterAdd0(self.handle, &native.raw, None, Some(&mut filter_id)) };

            NativeStatus::check(result)?;
            Ok(filter_id)
        }

        fn get_filter(&self, key: &Uuid) -> Result<(), NativeStatus> {
            let mut filter: *mut FWPM_FILTER0 = ptr::null_mut();
            let result = unsafe { FwpmFilterGetByKey0(self.handle, &to_guid(key), &mut filter) };
            unsafe { free_native(filter) };
            NativeStatus::check(result)
        }

        fn delete_filter_by_key(&self, key: &Uuid) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmFilterDeleteByKey0(self.handle, &to_guid(key)) })
        }

        fn delete_filter_by_id(&self, filter_id: u64) -> Result<(), NativeStatus> {
            NativeStatus::check(unsafe { FwpmFilterDeleteById0(self.handle, filter_id) })
        }
    }
}

#[cfg(not(windows))]
mod unsupported {
    use super::super::{BackendSession, FilterBackend, FilterRecord};
    use crate::builder::FilterPlan;
    use crate::error::{FilterError, FilterResult};
    use crate::identity::{ProviderSpec, SublayerSpec};
    use crate::status::NativeStatus;
    use std::convert::Infallible;
    use uuid::Uuid;

    /// Base Filtering Engine; only available on Windows
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WfpBackend;

    impl WfpBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl FilterBackend for WfpBackend {
        type Session = WfpSession;

        fn open_session(&self) -> FilterResult<WfpSession> {
            log::error!("The Windows Filtering Platform is only available on Windows");
            Err(FilterError::NotSupported)
        }
    }

    /// Never constructed off Windows
    pub enum WfpSession {}

    impl BackendSession for WfpSession {
        type Cursor = ();
        type AppId = Infallible;

        fn begin_transaction(&self) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn commit_transaction(&self) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn abort_transaction(&self) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn get_provider(&self, _key: &Uuid) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn add_provider(&self, _provider: &ProviderSpec) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn delete_provider(&self, _key: &Uuid) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn get_sublayer(&self, _key: &Uuid) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn add_sublayer(&self, _sublayer: &SublayerSpec) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn delete_sublayer(&self, _key: &Uuid) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn create_filter_enum(&self) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn fetch_filters(
            &self,
            _cursor: (),
            _max_entries: u32,
        ) -> Result<Vec<FilterRecord>, NativeStatus> {
            match *self {}
        }

        fn destroy_filter_enum(&self, _cursor: ()) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn resolve_app_id(&self, _path: &str) -> Result<Infallible, NativeStatus> {
            match *self {}
        }

        fn add_filter(
            &self,
            _plan: &FilterPlan,
            _app_id: Option<&Infallible>,
        ) -> Result<u64, NativeStatus> {
            match *self {}
        }

        fn get_filter(&self, _key: &Uuid) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn delete_filter_by_key(&self, _key: &Uuid) -> Result<(), NativeStatus> {
            match *self {}
        }

        fn delete_filter_by_id(&self, _filter_id: u64) -> Result<(), NativeStatus> {
            match *self {}
        }
    }

}
