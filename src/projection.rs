use crate::models::{PaymentRecord, PaymentStatus, Record};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub statuses: Option<Vec<String>>,
    pub text: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: usize,
    pub total_pages: u32,
}

pub fn project<R: Record>(records: Vec<R>, query: &ListQuery, default_page_size: u32) -> PageResponse<R> {
    let text = query
        .text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_lowercase);

    let filtered = records
        .into_iter()
        .filter(|record| match query.statuses.as_ref() {
            Some(statuses) if !statuses.is_empty() => record
                .status()
                .map(|status| statuses.iter().any(|wanted| wanted == status))
                .unwrap_or(false),
            _ => true,
        })
        .filter(|record| text.as_deref().map(|needle| record.matches_text(needle)).unwrap_or(true))
        .collect::<Vec<_>>();

    let page_size = query.page_size.unwrap_or(default_page_size).clamp(1, MAX_PAGE_SIZE);
    let total = filtered.len();
    let total_pages = total.div_ceil(page_size as usize) as u32;
    let page = query.page.unwrap_or(1).clamp(1, total_pages.max(1));
    let offset = (page as usize - 1) * page_size as usize;

    PageResponse {
        items: filtered.into_iter().skip(offset).take(page_size as usize).collect(),
        page,
        page_size,
        total,
        total_pages,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTotals {
    pub pending_cents: i64,
    pub paid_cents: i64,
    pub overdue_cents: i64,
    pub cancelled_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub totals: BTreeMap<String, StatusTotals>,
    pub overdue_count: usize,
}

impl PaymentSummary {
    pub fn from_records(payments: &[PaymentRecord], today: NaiveDate) -> Self {
        let mut summary = Self::default();
        for payment in payments {
            let status = match payment.status {
                PaymentStatus::Pending if payment.due_date.is_some_and(|due| due < today) => PaymentStatus::Overdue,
                status => status,
            };
            let totals = summary.totals.entry(payment.currency.clone()).or_default();
            match status {
                PaymentStatus::Pending => totals.pending_cents += payment.amount_cents,
                PaymentStatus::Paid => totals.paid_cents += payment.amount_cents,
                PaymentStatus::Overdue => {
                    totals.overdue_cents += payment.amount_cents;
                    summary.overdue_count += 1;
                }
                PaymentStatus::Cancelled => totals.cancelled_cents += payment.amount_cents,
            }
        }
        summary
    }
}
