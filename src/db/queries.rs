//! Query-struct-per-aggregate data access layer.

use crate::db::models::*;
use anyhow::{Context, Result};
use deadpool_postgres::{GenericClient, Object};
use rust_decimal::Decimal;

pub struct CommessaQueries;

impl CommessaQueries {
    pub async fn get(conn: &Object, id: i64) -> Result<Option<DbCommessa>> {
        let row = conn
            .query_opt("SELECT * FROM commesse WHERE id = $1", &[&id])
            .await
            .context("Failed to get commessa")?;
        Ok(row.map(DbCommessa::from))
    }

    pub async fn get_by_code(conn: &Object, code: &str) -> Result<Option<DbCommessa>> {
        let row = conn
            .query_opt("SELECT * FROM commesse WHERE code = $1", &[&code])
            .await
            .context("Failed to get commessa by code")?;
        Ok(row.map(DbCommessa::from))
    }

    pub async fn create(
        conn: &Object,
        code: &str,
        name: &str,
        business_unit: Option<&str>,
    ) -> Result<DbCommessa> {
        let row = conn
            .query_one(
                r#"
                INSERT INTO commesse (code, name, business_unit)
                VALUES ($1, $2, $3)
                RETURNING *
                "#,
                &[&code, &name, &business_unit],
            )
            .await
            .context("Failed to create commessa")?;
        Ok(DbCommessa::from(row))
    }
}

pub struct ComputoQueries;

impl ComputoQueries {
    pub async fn get(conn: &Object, id: i64) -> Result<Option<DbComputo>> {
        let row = conn
            .query_opt("SELECT * FROM computi WHERE id = $1", &[&id])
            .await
            .context("Failed to get computo")?;
        Ok(row.map(DbComputo::from))
    }

    /// The live project computo for a commessa: the most recently created
    /// row with `type = 'project'` (spec §3: "exactly one current project").
    pub async fn get_live_project(
        conn: &Object,
        commessa_id: i64,
    ) -> Result<Option<DbComputo>> {
        let row = conn
            .query_opt(
                r#"
                SELECT * FROM computi
                WHERE commessa_id = $1 AND type = 'project'
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                &[&commessa_id],
            )
            .await
            .context("Failed to get live project computo")?;
        Ok(row.map(DbComputo::from))
    }

    /// Unique within `(commessa, bidder, round_number)`.
    pub async fn get_return(
        conn: &Object,
        commessa_id: i64,
        bidder: &str,
        round_number: i32,
    ) -> Result<Option<DbComputo>> {
        let row = conn
            .query_opt(
                r#"
                SELECT * FROM computi
                WHERE commessa_id = $1 AND type = 'return'
                  AND bidder = $2 AND round_number = $3
                "#,
                &[&commessa_id, &bidder, &round_number],
            )
            .await
            .context("Failed to get return computo")?;
        Ok(row.map(DbComputo::from))
    }

    pub async fn next_round_number(
        conn: &Object,
        commessa_id: i64,
        bidder: &str,
    ) -> Result<i32> {
        let row = conn
            .query_one(
                r#"
                SELECT COALESCE(MAX(round_number), 0) + 1 AS next_round
                FROM computi
                WHERE commessa_id = $1 AND type = 'return' AND bidder = $2
                "#,
                &[&commessa_id, &bidder],
            )
            .await
            .context("Failed to compute next round number")?;
        Ok(row.get("next_round"))
    }

    pub async fn create(
        client: &impl GenericClient,
        commessa_id: i64,
        computo_type: &str,
        bidder: Option<&str>,
        round_number: Option<i32>,
        file_ref: Option<&str>,
        total_amount: Option<Decimal>,
        note: Option<&str>,
    ) -> Result<DbComputo> {
        let row = client
            .query_one(
                r#"
                INSERT INTO computi (
                    commessa_id, type, bidder, round_number, file_ref,
                    total_amount, note, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                RETURNING *
                "#,
                &[
                    &commessa_id,
                    &computo_type,
                    &bidder,
                    &round_number,
                    &file_ref,
                    &total_amount,
                    &note,
                ],
            )
            .await
            .context("Failed to create computo")?;
        Ok(DbComputo::from(row))
    }

    pub async fn store_matching_report(
        conn: &Object,
        computo_id: i64,
        report: serde_json::Value,
    ) -> Result<()> {
        conn.execute(
            "UPDATE computi SET matching_report = $2, updated_at = NOW() WHERE id = $1",
            &[&computo_id, &report],
        )
        .await
        .context("Failed to store matching report")?;
        Ok(())
    }

    /// Deletes a computo; cascades to its facts (I3). The parent `Voce`
    /// survives since it isn't owned by any single computo.
    pub async fn delete(client: &impl GenericClient, computo_id: i64) -> Result<()> {
        client
            .execute("DELETE FROM computi WHERE id = $1", &[&computo_id])
            .await
            .context("Failed to delete computo")?;
        Ok(())
    }

    /// One of the four watermarks `analysis_cache::DatasetVersionInputs`
    /// needs to assemble a commessa's dataset version (spec §4.6).
    pub async fn max_updated_at(
        conn: &Object,
        commessa_id: i64,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let row = conn
            .query_one(
                "SELECT MAX(updated_at) AS max_updated_at FROM computi WHERE commessa_id = $1",
                &[&commessa_id],
            )
            .await
            .context("Failed to compute max updated_at for computi")?;
        Ok(row.get("max_updated_at"))
    }
}

pub struct VoceComputoQueries;

impl VoceComputoQueries {
    pub async fn list_for_computo(conn: &Object, computo_id: i64) -> Result<Vec<DbVoceComputo>> {
        let rows = conn
            .query(
                "SELECT * FROM voce_computo WHERE computo_id = $1 ORDER BY order_index",
                &[&computo_id],
            )
            .await
            .context("Failed to list voce_computo rows")?;
        Ok(rows.into_iter().map(DbVoceComputo::from).collect())
    }

    /// Exclusive ownership by `computo_id`: wipes the existing rows first.
    pub async fn wipe_for_computo(client: &impl GenericClient, computo_id: i64) -> Result<()> {
        client
            .execute("DELETE FROM voce_computo WHERE computo_id = $1", &[&computo_id])
            .await
            .context("Failed to wipe voce_computo rows")?;
        Ok(())
    }

    /// `voce_computo` has no `updated_at` column, so the highest row id under
    /// the commessa stands in as the watermark `DatasetVersionInputs` needs
    /// (spec §4.6) — any rebuild inserts fresh rows with higher ids.
    pub async fn max_id(conn: &Object, commessa_id: i64) -> Result<Option<i64>> {
        let row = conn
            .query_one(
                "SELECT MAX(id) AS max_id FROM voce_computo WHERE commessa_id = $1",
                &[&commessa_id],
            )
            .await
            .context("Failed to compute max id for voce_computo")?;
        Ok(row.get("max_id"))
    }
}

pub struct VoceQueries;

impl VoceQueries {
    pub async fn list_for_commessa(conn: &Object, commessa_id: i64) -> Result<Vec<DbVoce>> {
        let rows = conn
            .query(
                "SELECT * FROM voci WHERE commessa_id = $1 ORDER BY order_index",
                &[&commessa_id],
            )
            .await
            .context("Failed to list voci")?;
        Ok(rows.into_iter().map(DbVoce::from).collect())
    }
}

pub struct PriceListItemQueries;

impl PriceListItemQueries {
    pub async fn list_for_commessa(conn: &Object, commessa_id: i64) -> Result<Vec<DbPriceListItem>> {
        let rows = conn
            .query(
                "SELECT * FROM price_list_items WHERE commessa_id = $1",
                &[&commessa_id],
            )
            .await
            .context("Failed to list price list items")?;
        Ok(rows.into_iter().map(DbPriceListItem::from).collect())
    }

    pub async fn get_by_product_id(
        conn: &Object,
        commessa_id: i64,
        product_id: &str,
    ) -> Result<Option<DbPriceListItem>> {
        let row = conn
            .query_opt(
                "SELECT * FROM price_list_items WHERE commessa_id = $1 AND product_id = $2",
                &[&commessa_id, &product_id],
            )
            .await
            .context("Failed to get price list item by product id")?;
        Ok(row.map(DbPriceListItem::from))
    }

    pub async fn max_updated_at(conn: &Object, commessa_id: i64) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let row = conn
            .query_one(
                "SELECT MAX(updated_at) AS max_updated_at FROM price_list_items WHERE commessa_id = $1",
                &[&commessa_id],
            )
            .await
            .context("Failed to compute max updated_at for price list items")?;
        Ok(row.get("max_updated_at"))
    }
}

pub struct PriceListOfferQueries;

impl PriceListOfferQueries {
    pub async fn list_for_computo(conn: &Object, computo_id: i64) -> Result<Vec<DbPriceListOffer>> {
        let rows = conn
            .query(
                "SELECT * FROM price_list_offers WHERE computo_id = $1",
                &[&computo_id],
            )
            .await
            .context("Failed to list price list offers")?;
        Ok(rows.into_iter().map(DbPriceListOffer::from).collect())
    }

    /// Unique per `(computo_id, price_list_item_id)` (I4): upsert keeps the
    /// first-registered price on conflict, matching the progressive
    /// first-wins rule used during alignment.
    pub async fn upsert_first_wins(
        client: &impl GenericClient,
        price_list_item_id: i64,
        commessa_id: i64,
        computo_id: i64,
        impresa_id: Option<i64>,
        impresa_label: Option<&str>,
        round_number: Option<i32>,
        unit_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<(DbPriceListOffer, bool)> {
        let existing = client
            .query_opt(
                "SELECT * FROM price_list_offers WHERE computo_id = $1 AND price_list_item_id = $2",
                &[&computo_id, &price_list_item_id],
            )
            .await
            .context("Failed to check existing price list offer")?;

        if let Some(row) = existing {
            return Ok((DbPriceListOffer::from(row), true));
        }

        let row = client
            .query_one(
                r#"
                INSERT INTO price_list_offers (
                    price_list_item_id, commessa_id, computo_id, impresa_id,
                    impresa_label, round_number, unit_price, quantity, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                RETURNING *
                "#,
                &[
                    &price_list_item_id,
                    &commessa_id,
                    &computo_id,
                    &impresa_id,
                    &impresa_label,
                    &round_number,
                    &unit_price,
                    &quantity,
                ],
            )
            .await
            .context("Failed to insert price list offer")?;
        Ok((DbPriceListOffer::from(row), false))
    }

    pub async fn manual_update(
        conn: &Object,
        computo_id: i64,
        price_list_item_id: i64,
        unit_price: Decimal,
    ) -> Result<DbPriceListOffer> {
        let row = conn
            .query_one(
                r#"
                UPDATE price_list_offers
                SET unit_price = $3, updated_at = NOW()
                WHERE computo_id = $1 AND price_list_item_id = $2
                RETURNING *
                "#,
                &[&computo_id, &price_list_item_id, &unit_price],
            )
            .await
            .context("Failed to manually update price list offer")?;
        Ok(DbPriceListOffer::from(row))
    }

    pub async fn max_updated_at(conn: &Object, commessa_id: i64) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let row = conn
            .query_one(
                "SELECT MAX(updated_at) AS max_updated_at FROM price_list_offers WHERE commessa_id = $1",
                &[&commessa_id],
            )
            .await
            .context("Failed to compute max updated_at for price list offers")?;
        Ok(row.get("max_updated_at"))
    }
}

pub struct ImpresaQueries;

impl ImpresaQueries {
    pub async fn get_by_normalized_label(
        conn: &Object,
        normalized_label: &str,
    ) -> Result<Option<DbImpresa>> {
        let row = conn
            .query_opt(
                "SELECT * FROM imprese WHERE normalized_label = $1",
                &[&normalized_label],
            )
            .await
            .context("Failed to get impresa by normalized label")?;
        Ok(row.map(DbImpresa::from))
    }

    /// Getter-or-create semantics (I6): duplicate labels collapse to the
    /// first row created under that normalized label.
    pub async fn get_or_create(
        client: &impl GenericClient,
        label: &str,
        normalized_label: &str,
    ) -> Result<DbImpresa> {
        if let Some(row) = client
            .query_opt(
                "SELECT * FROM imprese WHERE normalized_label = $1",
                &[&normalized_label],
            )
            .await
            .context("Failed to look up impresa")?
        {
            return Ok(DbImpresa::from(row));
        }

        let row = client
            .query_one(
                r#"
                INSERT INTO imprese (label, normalized_label)
                VALUES ($1, $2)
                ON CONFLICT (normalized_label) DO UPDATE SET label = imprese.label
                RETURNING *
                "#,
                &[&label, &normalized_label],
            )
            .await
            .context("Failed to create impresa")?;
        Ok(DbImpresa::from(row))
    }
}

pub struct VoceProgettoQueries;

impl VoceProgettoQueries {
    /// Upserts the one `(voce, computo)` fact row a project snapshot rebuild
    /// produces; `computo_id` must reference a project-typed computo (I3).
    pub async fn upsert(
        client: &impl GenericClient,
        voce_id: i64,
        computo_id: i64,
        quantity: Option<Decimal>,
        unit_price: Option<Decimal>,
        amount: Option<Decimal>,
        note: Option<&str>,
    ) -> Result<DbVoceProgetto> {
        let row = client
            .query_one(
                r#"
                INSERT INTO voce_progetto (voce_id, computo_id, quantity, unit_price, amount, note)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (voce_id, computo_id) DO UPDATE
                SET quantity = EXCLUDED.quantity, unit_price = EXCLUDED.unit_price,
                    amount = EXCLUDED.amount, note = EXCLUDED.note
                RETURNING *
                "#,
                &[&voce_id, &computo_id, &quantity, &unit_price, &amount, &note],
            )
            .await
            .context("Failed to upsert voce_progetto")?;
        Ok(DbVoceProgetto::from(row))
    }

    pub async fn delete_for_computo(client: &impl GenericClient, computo_id: i64) -> Result<()> {
        client
            .execute("DELETE FROM voce_progetto WHERE computo_id = $1", &[&computo_id])
            .await
            .context("Failed to delete voce_progetto for computo")?;
        Ok(())
    }
}

pub struct VoceOffertaQueries;

impl VoceOffertaQueries {
    /// Upserts the one `(voce, computo)` fact row for a return; `computo_id`
    /// must reference a return-typed computo (I3).
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        client: &impl GenericClient,
        voce_id: i64,
        computo_id: i64,
        impresa_id: Option<i64>,
        round_number: Option<i32>,
        quantity: Option<Decimal>,
        unit_price: Option<Decimal>,
        amount: Option<Decimal>,
        note: Option<&str>,
    ) -> Result<DbVoceOfferta> {
        let row = client
            .query_one(
                r#"
                INSERT INTO voce_offerta
                    (voce_id, computo_id, impresa_id, round_number, quantity, unit_price, amount, note)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (voce_id, computo_id) DO UPDATE
                SET impresa_id = EXCLUDED.impresa_id, round_number = EXCLUDED.round_number,
                    quantity = EXCLUDED.quantity, unit_price = EXCLUDED.unit_price,
                    amount = EXCLUDED.amount, note = EXCLUDED.note
                RETURNING *
                "#,
                &[
                    &voce_id,
                    &computo_id,
                    &impresa_id,
                    &round_number,
                    &quantity,
                    &unit_price,
                    &amount,
                    &note,
                ],
            )
            .await
            .context("Failed to upsert voce_offerta")?;
        Ok(DbVoceOfferta::from(row))
    }

    pub async fn list_for_computo(conn: &Object, computo_id: i64) -> Result<Vec<DbVoceOfferta>> {
        let rows = conn
            .query("SELECT * FROM voce_offerta WHERE computo_id = $1", &[&computo_id])
            .await
            .context("Failed to list voce_offerta for computo")?;
        Ok(rows.into_iter().map(DbVoceOfferta::from).collect())
    }

    pub async fn delete_for_computo(client: &impl GenericClient, computo_id: i64) -> Result<()> {
        client
            .execute("DELETE FROM voce_offerta WHERE computo_id = $1", &[&computo_id])
            .await
            .context("Failed to delete voce_offerta for computo")?;
        Ok(())
    }
}

pub struct SettingsQueries;

impl SettingsQueries {
    pub async fn get(conn: &Object) -> Result<DbSettings> {
        let row = conn
            .query_one("SELECT * FROM settings WHERE id = 1", &[])
            .await
            .context("Failed to get settings")?;
        Ok(DbSettings::from(row))
    }

    pub async fn update_thresholds(
        conn: &Object,
        criticita_media_percent: Decimal,
        criticita_alta_percent: Decimal,
    ) -> Result<DbSettings> {
        let row = conn
            .query_one(
                r#"
                UPDATE settings
                SET criticita_media_percent = $1, criticita_alta_percent = $2
                WHERE id = 1
                RETURNING *
                "#,
                &[&criticita_media_percent, &criticita_alta_percent],
            )
            .await
            .context("Failed to update thresholds")?;
        Ok(DbSettings::from(row))
    }
}
