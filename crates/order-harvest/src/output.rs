//! Final catalogue and CRM files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use tracing::info;

use crate::config::ProfileKind;
use crate::crm::CrmRecord;
use crate::errors::HarvestError;
use crate::formatter::FormattedOrder;
use crate::ledger::CostReport;

const HEADER_RULE: usize = 80;
const ORDER_RULE: usize = 60;
const CLIENT_RULE: usize = 30;

/// Paths written by [`write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub catalogue: PathBuf,
    pub crm: PathBuf,
}

fn display_date<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    at.format("%d/%m/%Y %H:%M:%S").to_string()
}

fn header(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    let rule = "=".repeat(HEADER_RULE);
    writeln!(f, "{rule}")?;
    writeln!(f, "{title:^HEADER_RULE$}")?;
    writeln!(f, "{rule}\n")
}

/// Order catalogue file body.
pub struct Catalogue<'a, Tz: TimeZone> {
    pub orders: &'a [FormattedOrder],
    pub generated_at: &'a DateTime<Tz>,
}

impl<Tz: TimeZone> fmt::Display for Catalogue<'_, Tz>
where
    Tz::Offset: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        header(f, "PEDIDOS - CATÁLOGO DE PEDIDOS")?;
        writeln!(f, "Total pedidos: {}", self.orders.len())?;
        writeln!(f, "Fecha: {}\n", display_date(self.generated_at))?;
        writeln!(f, "{}\n", "=".repeat(HEADER_RULE))?;

        let order_rule = "=".repeat(ORDER_RULE);
        for (i, order) in self.orders.iter().enumerate() {
            writeln!(f, "=== PEDIDO {:03} ===", i + 1)?;
            write!(f, "{order}\n\n{order_rule}\n\n")?;
        }
        Ok(())
    }
}

/// CRM file body, headed by the session's cost totals.
pub struct CrmReport<'a, Tz: TimeZone> {
    pub records: &'a [CrmRecord],
    pub cost: &'a CostReport,
    pub generated_at: &'a DateTime<Tz>,
}

impl<Tz: TimeZone> fmt::Display for CrmReport<'_, Tz>
where
    Tz::Offset: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        header(f, "CRM - DATOS DE CLIENTES")?;
        writeln!(f, "Total de clientes: {}", self.records.len())?;
        writeln!(f, "Fecha de extracción: {}", display_date(self.generated_at))?;
        writeln!(f, "Costo total sesión: ${:.4}", self.cost.total_cost)?;
        writeln!(f, "Requests totales: {}\n", self.cost.total_requests)?;
        writeln!(f, "{}\n", "=".repeat(HEADER_RULE))?;

        let client_rule = "-".repeat(CLIENT_RULE);
        for (i, record) in self.records.iter().enumerate() {
            writeln!(f, "CLIENTE {:03}", i + 1)?;
            writeln!(f, "{client_rule}")?;
            writeln!(f, "Nombre: {}", record.name)?;
            writeln!(f, "Cédula: {}", record.national_id)?;
            writeln!(f, "Email: {}", record.email)?;
            writeln!(f, "Fecha cumpleaños: {}", record.birthdate)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Render the order catalogue.
pub fn render_catalogue<Tz: TimeZone>(orders: &[FormattedOrder], generated_at: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    Catalogue {
        orders,
        generated_at,
    }
    .to_string()
}

/// Render the CRM extract with the session's cost totals.
pub fn render_crm<Tz: TimeZone>(
    records: &[CrmRecord],
    cost: &CostReport,
    generated_at: &DateTime<Tz>,
) -> String
where
    Tz::Offset: fmt::Display,
{
    CrmReport {
        records,
        cost,
        generated_at,
    }
    .to_string()
}

/// `PEDIDOS_<PROFILE>_<stamp>.txt` and `CRM_<PROFILE>_<stamp>.txt`.
pub fn output_file_names<Tz: TimeZone>(profile: ProfileKind, at: &DateTime<Tz>) -> (String, String)
where
    Tz::Offset: fmt::Display,
{
    let stamp = at.format("%Y%m%d_%H%M%S");
    let tag = profile.file_tag();
    (
        format!("PEDIDOS_{tag}_{stamp}.txt"),
        format!("CRM_{tag}_{stamp}.txt"),
    )
}

/// Write both final files into `out_dir`, stamped with the local time.
pub fn write_outputs(
    out_dir: &Path,
    profile: ProfileKind,
    orders: &[FormattedOrder],
    records: &[CrmRecord],
    cost: &CostReport,
) -> Result<OutputPaths, HarvestError> {
    let now = Local::now();
    fs::create_dir_all(out_dir)?;
    let (catalogue_name, crm_name) = output_file_names(profile, &now);

    let paths = OutputPaths {
        catalogue: out_dir.join(catalogue_name),
        crm: out_dir.join(crm_name),
    };
    fs::write(&paths.catalogue, render_catalogue(orders, &now))?;
    fs::write(&paths.crm, render_crm(records, cost, &now))?;

    info!(
        catalogue = %paths.catalogue.display(),
        crm = %paths.crm.display(),
        orders = orders.len(),
        clients = records.len(),
        "final files written"
    );
    Ok(paths)
}
