//! Static institution routing table.

use std::collections::HashMap;

use finlink_core::{InstitutionRoute, InstitutionRouting, ProviderId, Region, StoreError};

/// Institution → provider table loaded once at startup.
///
/// A route registered for [`Region::Global`] applies to every region that
/// has no route of its own.
#[derive(Debug, Clone, Default)]
pub struct StaticInstitutionRouting {
    routes: HashMap<(String, Region), InstitutionRoute>,
}

impl StaticInstitutionRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(
        mut self,
        institution_id: impl Into<String>,
        region: Region,
        primary: impl Into<ProviderId>,
        backups: Vec<ProviderId>,
    ) -> Self {
        self.insert(
            institution_id,
            region,
            InstitutionRoute {
                primary: primary.into(),
                backups,
            },
        );
        self
    }

    pub fn insert(&mut self, institution_id: impl Into<String>, region: Region, route: InstitutionRoute) {
        self.routes.insert((institution_id.into(), region), route);
    }
}

impl InstitutionRouting for StaticInstitutionRouting {
    fn route(
        &self,
        institution_id: &str,
        region: Region,
    ) -> Result<Option<InstitutionRoute>, StoreError> {
        let route = self
            .routes
            .get(&(institution_id.to_string(), region))
            .or_else(|| self.routes.get(&(institution_id.to_string(), Region::Global)))
            .cloned();
        Ok(route)
    }
}
