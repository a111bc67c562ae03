//! Conversion ranking per broker. Read-only.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::directory::Directory;
use crate::model::*;
use crate::store::{DateWindow, Store, StoreError};

/// One broker's line in the ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingRow {
    pub broker_id: String,
    pub corretor: String,
    pub visitas_totais: u32,
    pub canceladas: u32,
    pub realizadas: u32,
    pub alugados: u32,
    /// Rented over all visits, in percent.
    pub taxa_conversao: f64,
    /// Rented over completed visits, in percent.
    pub taxa_efetiva: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingTotals {
    pub corretores: u32,
    pub visitas_totais: u32,
    pub canceladas: u32,
    pub realizadas: u32,
    pub alugados: u32,
    pub taxa_conversao: f64,
    pub taxa_efetiva: f64,
}

/// Report filters. `consultant` matches the owner by name or email, or a
/// share by email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFilter {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub broker_id: Option<String>,
    pub consultant: Option<Consultant>,
}

impl ReportFilter {
    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from,
            to,
            broker_id: None,
            consultant: None,
        }
    }
}

/// Only admins and masters see the ranking.
pub fn can_view_reports(role: Role) -> bool {
    role.has_admin_rights()
}

fn percent(part: u32, whole: u32) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 * 100.0 }
}

/// Visits (never events or deleted rows) matching the filter.
pub fn filter_for_report<'a>(appointments: &'a [Appointment], filter: &ReportFilter) -> Vec<&'a Appointment> {
    appointments
        .iter()
        .filter(|a| !a.is_event && !a.is_deleted())
        .filter(|a| a.date >= filter.from && a.date <= filter.to)
        .filter(|a| {
            filter
                .broker_id
                .as_deref()
                .is_none_or(|b| normalize_email(&a.broker_id) == normalize_email(b))
        })
        .filter(|a| {
            filter.consultant.as_ref().is_none_or(|c| {
                a.created_by_name == c.name
                    || (!c.email.is_empty() && (a.is_creator(&c.email) || a.is_shared_with(&c.email)))
            })
        })
        .collect()
}

/// Group by broker and rank by conversion rate, best first.
pub fn build_ranking<'a>(
    appointments: impl IntoIterator<Item = &'a Appointment>,
    directory: &Directory,
) -> Vec<RankingRow> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, RankingRow> = HashMap::new();

    for appt in appointments {
        let broker_id = match normalize_email(&appt.broker_id) {
            id if id.is_empty() => "desconhecido".to_string(),
            id => id,
        };
        let row = groups.entry(broker_id.clone()).or_insert_with(|| {
            order.push(broker_id.clone());
            RankingRow {
                corretor: directory
                    .broker(&broker_id)
                    .map(|b| b.name.clone())
                    .unwrap_or_else(|| "Sem corretor".to_string()),
                broker_id,
                visitas_totais: 0,
                canceladas: 0,
                realizadas: 0,
                alugados: 0,
                taxa_conversao: 0.0,
                taxa_efetiva: 0.0,
            }
        });

        row.visitas_totais += 1;
        match appt.status {
            Status::Cancelada => row.canceladas += 1,
            Status::Realizada => row.realizadas += 1,
            _ => {}
        }
        if appt.counts_as_rented() {
            row.alugados += 1;
        }
    }

    let mut rows: Vec<RankingRow> = order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .map(|mut row| {
            row.taxa_conversao = percent(row.alugados, row.visitas_totais);
            row.taxa_efetiva = percent(row.alugados, row.realizadas);
            row
        })
        .collect();
    rows.sort_by(|a, b| b.taxa_conversao.total_cmp(&a.taxa_conversao));
    rows
}

pub fn totals(rows: &[RankingRow]) -> RankingTotals {
    let mut t = rows.iter().fold(RankingTotals::default(), |mut acc, row| {
        acc.corretores += 1;
        acc.visitas_totais += row.visitas_totais;
        acc.canceladas += row.canceladas;
        acc.realizadas += row.realizadas;
        acc.alugados += row.alugados;
        acc
    });
    t.taxa_conversao = percent(t.alugados, t.visitas_totais);
    t.taxa_efetiva = percent(t.alugados, t.realizadas);
    t
}

/// `12,50%`, as the board prints rates.
pub fn format_percent(value: f64) -> String {
    format!("{value:.2}%").replace('.', ",")
}

/// Fetch the filtered range from the store and rank it.
pub async fn load_ranking(
    store: &dyn Store,
    directory: &Directory,
    filter: &ReportFilter,
) -> Result<(Vec<RankingRow>, RankingTotals), StoreError> {
    let docs = store
        .query_range(DateWindow::new(filter.from, filter.to, usize::MAX))
        .await?;
    let rows = build_ranking(filter_for_report(&docs, filter), directory);
    let t = totals(&rows);
    tracing::debug!(brokers = rows.len(), visits = t.visitas_totais, "ranking built");
    Ok((rows, t))
}
