//! PostgreSQL fee store.

use crate::models::{
    derive_status, format_invoice_number, AcademicPeriod, ApprovalDecision, ApprovalPayload,
    ApprovalRequest, ApprovalStatus, CallbackOutcome, CreateAcademicPeriod, CreateFeeStructure,
    CreateSchool, CreateSchoolClass, CreateStudent, FeeCategory, FeeStructure,
    ImpersonationSession, Invoice, InvoiceItem, InvoiceStatus, ListApprovalsFilter,
    ListInvoicesFilter, ListPaymentsFilter, ListStudentsFilter, NewApprovalRequest,
    NewImpersonationSession, NewInvoice, NewInvoiceItem, NewPayment, Payment, PaymentStatus,
    School, SchoolClass, SchoolSummary, Student,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    approval_already_resolved, approval_not_found, checkout_not_found, invoice_cancelled,
    invoice_not_found, proposal_outdated, FeeStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// A racing callback can claim the same gateway transaction between the
/// reuse check and the update; the unique index reports it.
fn transaction_reuse_error(gateway_transaction_id: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| {
        if is_unique_violation(&e) {
            AppError::Conflict(anyhow::anyhow!(
                "Gateway transaction {} was already reconciled",
                gateway_transaction_id
            ))
        } else {
            AppError::DatabaseError(anyhow::anyhow!("Failed to complete payment: {}", e))
        }
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "paydesk-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Row helpers shared by the transactional operations
    // -------------------------------------------------------------------------

    async fn lock_invoice(
        conn: &mut PgConnection,
        school_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let mut invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, school_id, student_id, academic_period_id, invoice_number,
                total_amount, paid_amount, balance, status, due_date, created_by, created_utc, cancelled_utc
            FROM invoices
            WHERE school_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(school_id)
        .bind(invoice_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to lock invoice"))?
        .ok_or_else(|| invoice_not_found(invoice_id))?;

        invoice.items = Self::fetch_items(conn, invoice_id).await?;
        Ok(invoice)
    }

    async fn fetch_items(
        conn: &mut PgConnection,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceItem>, AppError> {
        sqlx::query_as::<_, InvoiceItem>(
            r#"
            SELECT item_id, invoice_id, description, amount, category, fee_structure_id,
                is_dismissed, sort_order, created_utc
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY sort_order, created_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to fetch invoice items"))
    }

    async fn insert_item(
        conn: &mut PgConnection,
        invoice_id: Uuid,
        item: &NewInvoiceItem,
        sort_order: i32,
    ) -> Result<InvoiceItem, AppError> {
        sqlx::query_as::<_, InvoiceItem>(
            r#"
            INSERT INTO invoice_items (item_id, invoice_id, description, amount, category, fee_structure_id, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING item_id, invoice_id, description, amount, category, fee_structure_id,
                is_dismissed, sort_order, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(&item.description)
        .bind(item.amount)
        .bind(item.category.as_str())
        .bind(item.fee_structure_id)
        .bind(sort_order)
        .fetch_one(conn)
        .await
        .map_err(db_error("Failed to insert invoice item"))
    }

    async fn save_invoice(conn: &mut PgConnection, invoice: &Invoice) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE invoices
            SET total_amount = $2, paid_amount = $3, balance = $4, status = $5, cancelled_utc = $6
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.total_amount)
        .bind(invoice.paid_amount)
        .bind(invoice.balance)
        .bind(invoice.status.as_str())
        .bind(invoice.cancelled_utc)
        .execute(conn)
        .await
        .map_err(db_error("Failed to update invoice"))?;
        Ok(())
    }

    async fn lock_payment_by_checkout(
        conn: &mut PgConnection,
        checkout_request_id: &str,
    ) -> Result<Payment, AppError> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, school_id, student_id, invoice_id, amount, method, status, reference,
                phone_number, checkout_request_id, gateway_transaction_id, recorded_by, created_utc, completed_utc
            FROM payments
            WHERE checkout_request_id = $1
            FOR UPDATE
            "#,
        )
        .bind(checkout_request_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to lock payment"))?
        .ok_or_else(|| checkout_not_found(checkout_request_id))
    }
}

fn next_sort_order(items: &[InvoiceItem]) -> i32 {
    items.iter().map(|item| item.sort_order).max().map_or(0, |max| max + 1)
}

fn ensure_non_negative_total(invoice: &Invoice) -> Result<(), AppError> {
    if invoice.total_amount < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice {} total would become negative ({})",
            invoice.invoice_id,
            invoice.total_amount
        )));
    }
    Ok(())
}

#[async_trait]
impl FeeStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Schools
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(code = %input.code))]
    async fn create_school(&self, input: &CreateSchool) -> Result<School, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_school"])
            .start_timer();

        let school = sqlx::query_as::<_, School>(
            r#"
            INSERT INTO schools (school_id, name, code)
            VALUES ($1, $2, $3)
            RETURNING school_id, name, code, active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.code)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("School code '{}' is already in use", input.code))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create school: {}", e))
            }
        })?;

        timer.observe_duration();

        info!(school_id = %school.school_id, code = %school.code, "School created");

        Ok(school)
    }

    #[instrument(skip(self))]
    async fn get_school(&self, school_id: Uuid) -> Result<Option<School>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_school"])
            .start_timer();

        let school = sqlx::query_as::<_, School>(
            "SELECT school_id, name, code, active, created_utc FROM schools WHERE school_id = $1",
        )
        .bind(school_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get school"))?;

        timer.observe_duration();

        Ok(school)
    }

    #[instrument(skip(self))]
    async fn list_school_summaries(&self) -> Result<Vec<SchoolSummary>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_school_summaries"])
            .start_timer();

        let summaries = sqlx::query_as::<_, SchoolSummary>(
            r#"
            SELECT s.school_id, s.name, s.code,
                (SELECT COUNT(*) FROM students st WHERE st.school_id = s.school_id) AS student_count,
                COALESCE((SELECT SUM(i.total_amount) FROM invoices i
                          WHERE i.school_id = s.school_id AND i.status <> 'CANCELLED'), 0) AS invoiced_total,
                COALESCE((SELECT SUM(p.amount) FROM payments p
                          WHERE p.school_id = s.school_id AND p.status = 'COMPLETED'), 0) AS collected_total,
                COALESCE((SELECT SUM(i.balance) FROM invoices i
                          WHERE i.school_id = s.school_id AND i.status <> 'CANCELLED'), 0) AS outstanding_total
            FROM schools s
            ORDER BY s.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list school summaries"))?;

        timer.observe_duration();

        Ok(summaries)
    }

    // -------------------------------------------------------------------------
    // Academic periods and classes
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(school_id = %input.school_id))]
    async fn create_period(&self, input: &CreateAcademicPeriod) -> Result<AcademicPeriod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_period"])
            .start_timer();

        let period = sqlx::query_as::<_, AcademicPeriod>(
            r#"
            INSERT INTO academic_periods (period_id, school_id, term, academic_year)
            VALUES ($1, $2, $3, $4)
            RETURNING period_id, school_id, term, academic_year, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(&input.term)
        .bind(input.academic_year)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Period {} {} already exists",
                    input.term,
                    input.academic_year
                ))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create period: {}", e))
            }
        })?;

        timer.observe_duration();

        info!(period_id = %period.period_id, label = %period.label(), "Academic period created");

        Ok(period)
    }

    #[instrument(skip(self))]
    async fn get_period(
        &self,
        school_id: Uuid,
        period_id: Uuid,
    ) -> Result<Option<AcademicPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_period"])
            .start_timer();

        let period = sqlx::query_as::<_, AcademicPeriod>(
            r#"
            SELECT period_id, school_id, term, academic_year, is_active, created_utc
            FROM academic_periods
            WHERE school_id = $1 AND period_id = $2
            "#,
        )
        .bind(school_id)
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get period"))?;

        timer.observe_duration();

        Ok(period)
    }

    #[instrument(skip(self))]
    async fn list_periods(&self, school_id: Uuid) -> Result<Vec<AcademicPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_periods"])
            .start_timer();

        let periods = sqlx::query_as::<_, AcademicPeriod>(
            r#"
            SELECT period_id, school_id, term, academic_year, is_active, created_utc
            FROM academic_periods
            WHERE school_id = $1
            ORDER BY academic_year DESC, term
            "#,
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list periods"))?;

        timer.observe_duration();

        Ok(periods)
    }

    #[instrument(skip(self))]
    async fn activate_period(
        &self,
        school_id: Uuid,
        period_id: Uuid,
    ) -> Result<Option<AcademicPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["activate_period"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let exists = sqlx::query_scalar::<_, Uuid>(
            "SELECT period_id FROM academic_periods WHERE school_id = $1 AND period_id = $2 FOR UPDATE",
        )
        .bind(school_id)
        .bind(period_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock period"))?;

        if exists.is_none() {
            tx.rollback().await.ok();
            return Ok(None);
        }

        sqlx::query(
            "UPDATE academic_periods SET is_active = FALSE WHERE school_id = $1 AND is_active AND period_id <> $2",
        )
        .bind(school_id)
        .bind(period_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to deactivate periods"))?;

        let period = sqlx::query_as::<_, AcademicPeriod>(
            r#"
            UPDATE academic_periods SET is_active = TRUE
            WHERE period_id = $1
            RETURNING period_id, school_id, term, academic_year, is_active, created_utc
            "#,
        )
        .bind(period_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to activate period"))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(period_id = %period_id, "Academic period activated");

        Ok(Some(period))
    }

    #[instrument(skip(self, input), fields(school_id = %input.school_id))]
    async fn create_class(&self, input: &CreateSchoolClass) -> Result<SchoolClass, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_class"])
            .start_timer();

        let class = sqlx::query_as::<_, SchoolClass>(
            r#"
            INSERT INTO school_classes (class_id, school_id, name)
            VALUES ($1, $2, $3)
            RETURNING class_id, school_id, name, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(&input.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("Class '{}' already exists", input.name))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create class: {}", e))
            }
        })?;

        timer.observe_duration();

        Ok(class)
    }

    #[instrument(skip(self))]
    async fn get_class(
        &self,
        school_id: Uuid,
        class_id: Uuid,
    ) -> Result<Option<SchoolClass>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_class"])
            .start_timer();

        let class = sqlx::query_as::<_, SchoolClass>(
            "SELECT class_id, school_id, name, created_utc FROM school_classes WHERE school_id = $1 AND class_id = $2",
        )
        .bind(school_id)
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get class"))?;

        timer.observe_duration();

        Ok(class)
    }

    #[instrument(skip(self))]
    async fn list_classes(&self, school_id: Uuid) -> Result<Vec<SchoolClass>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_classes"])
            .start_timer();

        let classes = sqlx::query_as::<_, SchoolClass>(
            "SELECT class_id, school_id, name, created_utc FROM school_classes WHERE school_id = $1 ORDER BY name",
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list classes"))?;

        timer.observe_duration();

        Ok(classes)
    }

    // -------------------------------------------------------------------------
    // Students
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(school_id = %input.school_id, admission_number = %input.admission_number))]
    async fn create_student(&self, input: &CreateStudent) -> Result<Student, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_student"])
            .start_timer();

        let student = sqlx::query_as::<_, Student>(
            r#"
            INSERT INTO students (student_id, school_id, class_id, admission_number, first_name, last_name, parent_user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING student_id, school_id, class_id, admission_number, first_name, last_name,
                parent_user_id, active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(input.class_id)
        .bind(&input.admission_number)
        .bind(&input.first_name)
        .bind(&input.last_name)
        .bind(&input.parent_user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Admission number '{}' is already in use",
                    input.admission_number
                ))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create student: {}", e))
            }
        })?;

        timer.observe_duration();

        info!(student_id = %student.student_id, "Student created");

        Ok(student)
    }

    #[instrument(skip(self))]
    async fn get_student(
        &self,
        school_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<Student>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_student"])
            .start_timer();

        let student = sqlx::query_as::<_, Student>(
            r#"
            SELECT student_id, school_id, class_id, admission_number, first_name, last_name,
                parent_user_id, active, created_utc
            FROM students
            WHERE school_id = $1 AND student_id = $2
            "#,
        )
        .bind(school_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get student"))?;

        timer.observe_duration();

        Ok(student)
    }

    #[instrument(skip(self, filter))]
    async fn list_students(
        &self,
        school_id: Uuid,
        filter: &ListStudentsFilter,
    ) -> Result<Vec<Student>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_students"])
            .start_timer();

        let students = sqlx::query_as::<_, Student>(
            r#"
            SELECT student_id, school_id, class_id, admission_number, first_name, last_name,
                parent_user_id, active, created_utc
            FROM students
            WHERE school_id = $1
              AND ($2::uuid IS NULL OR class_id = $2)
              AND ($3::boolean IS NULL OR active = $3)
              AND ($4::varchar IS NULL OR parent_user_id = $4)
            ORDER BY admission_number
            "#,
        )
        .bind(school_id)
        .bind(filter.class_id)
        .bind(filter.active)
        .bind(&filter.parent_user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list students"))?;

        timer.observe_duration();

        Ok(students)
    }

    #[instrument(skip(self))]
    async fn set_student_active(
        &self,
        school_id: Uuid,
        student_id: Uuid,
        active: bool,
    ) -> Result<Option<Student>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_student_active"])
            .start_timer();

        let student = sqlx::query_as::<_, Student>(
            r#"
            UPDATE students SET active = $3
            WHERE school_id = $1 AND student_id = $2
            RETURNING student_id, school_id, class_id, admission_number, first_name, last_name,
                parent_user_id, active, created_utc
            "#,
        )
        .bind(school_id)
        .bind(student_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update student"))?;

        timer.observe_duration();

        Ok(student)
    }

    // -------------------------------------------------------------------------
    // Fee structures
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(school_id = %input.school_id, period_id = %input.academic_period_id))]
    async fn create_fee_structure(
        &self,
        input: &CreateFeeStructure,
    ) -> Result<FeeStructure, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_fee_structure"])
            .start_timer();

        let fee = sqlx::query_as::<_, FeeStructure>(
            r#"
            INSERT INTO fee_structures (fee_structure_id, school_id, academic_period_id, class_id, name, amount, category)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING fee_structure_id, school_id, academic_period_id, class_id, name, amount, category, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(input.academic_period_id)
        .bind(input.class_id)
        .bind(&input.name)
        .bind(input.amount)
        .bind(input.category.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create fee structure"))?;

        timer.observe_duration();

        info!(fee_structure_id = %fee.fee_structure_id, amount = %fee.amount, "Fee structure created");

        Ok(fee)
    }

    #[instrument(skip(self))]
    async fn list_fee_structures(
        &self,
        school_id: Uuid,
        academic_period_id: Option<Uuid>,
    ) -> Result<Vec<FeeStructure>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_fee_structures"])
            .start_timer();

        let fees = sqlx::query_as::<_, FeeStructure>(
            r#"
            SELECT fee_structure_id, school_id, academic_period_id, class_id, name, amount, category, created_utc
            FROM fee_structures
            WHERE school_id = $1
              AND ($2::uuid IS NULL OR academic_period_id = $2)
            ORDER BY created_utc
            "#,
        )
        .bind(school_id)
        .bind(academic_period_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list fee structures"))?;

        timer.observe_duration();

        Ok(fees)
    }

    #[instrument(skip(self, fee_structure_ids), fields(count = fee_structure_ids.len()))]
    async fn get_fee_structures(
        &self,
        school_id: Uuid,
        fee_structure_ids: &[Uuid],
    ) -> Result<Vec<FeeStructure>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_fee_structures"])
            .start_timer();

        let fees = sqlx::query_as::<_, FeeStructure>(
            r#"
            SELECT fee_structure_id, school_id, academic_period_id, class_id, name, amount, category, created_utc
            FROM fee_structures
            WHERE school_id = $1 AND fee_structure_id = ANY($2)
            ORDER BY created_utc
            "#,
        )
        .bind(school_id)
        .bind(fee_structure_ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to get fee structures"))?;

        timer.observe_duration();

        Ok(fees)
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(student_id = %input.student_id, period_id = %input.academic_period_id))]
    async fn create_invoice(&self, input: &NewInvoice, today: NaiveDate) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let sequence = sqlx::query_scalar::<_, i64>(
            "UPDATE schools SET invoice_sequence = invoice_sequence + 1 WHERE school_id = $1 RETURNING invoice_sequence",
        )
        .bind(input.school_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to allocate invoice number"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("School {} not found", input.school_id)))?;

        let total = input.total();
        let status = derive_status(InvoiceStatus::Pending, total, Decimal::ZERO, input.due_date, today);

        let result = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (invoice_id, school_id, student_id, academic_period_id, invoice_number,
                total_amount, paid_amount, balance, status, due_date, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $6, $7, $8, $9)
            RETURNING invoice_id, school_id, student_id, academic_period_id, invoice_number,
                total_amount, paid_amount, balance, status, due_date, created_by, created_utc, cancelled_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(input.student_id)
        .bind(input.academic_period_id)
        .bind(format_invoice_number(today.year(), sequence))
        .bind(total)
        .bind(status.as_str())
        .bind(input.due_date)
        .bind(&input.created_by)
        .fetch_one(&mut *tx)
        .await;

        let mut invoice = match result {
            Ok(invoice) => invoice,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.ok();
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Student {} already has an invoice for period {}",
                    input.student_id,
                    input.academic_period_id
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create invoice: {}",
                    e
                )));
            }
        };

        for (index, item) in input.items.iter().enumerate() {
            let inserted = Self::insert_item(&mut tx, invoice.invoice_id, item, index as i32).await?;
            invoice.items.push(inserted);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total_amount,
            "Invoice created"
        );

        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn get_invoice(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, school_id, student_id, academic_period_id, invoice_number,
                total_amount, paid_amount, balance, status, due_date, created_by, created_utc, cancelled_utc
            FROM invoices
            WHERE school_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(school_id)
        .bind(invoice_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to get invoice"))?;

        let invoice = match invoice {
            Some(mut invoice) => {
                invoice.items = Self::fetch_items(&mut conn, invoice_id).await?;
                Some(invoice)
            }
            None => None,
        };

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self, filter))]
    async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let status_str = filter.status.map(|s| s.as_str().to_string());

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, school_id, student_id, academic_period_id, invoice_number,
                total_amount, paid_amount, balance, status, due_date, created_by, created_utc, cancelled_utc
            FROM invoices
            WHERE school_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR student_id = $3)
              AND ($4::uuid IS NULL OR academic_period_id = $4)
            ORDER BY created_utc DESC, invoice_id
            "#,
        )
        .bind(school_id)
        .bind(&status_str)
        .bind(filter.student_id)
        .bind(filter.academic_period_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list invoices"))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self, item), fields(amount = %item.amount))]
    async fn add_invoice_item(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        item: &NewInvoiceItem,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_invoice_item"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut invoice = Self::lock_invoice(&mut tx, school_id, invoice_id).await?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(invoice_cancelled(invoice_id));
        }

        let sort_order = next_sort_order(&invoice.items);
        let inserted = Self::insert_item(&mut tx, invoice_id, item, sort_order).await?;
        invoice.items.push(inserted);
        invoice.recompute(today);
        ensure_non_negative_total(&invoice)?;

        Self::save_invoice(&mut tx, &invoice).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn dismiss_invoice_item(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        item_id: Uuid,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["dismiss_invoice_item"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut invoice = Self::lock_invoice(&mut tx, school_id, invoice_id).await?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(invoice_cancelled(invoice_id));
        }

        let item = invoice
            .items
            .iter_mut()
            .find(|item| item.item_id == item_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Item {} not found on invoice {}",
                    item_id,
                    invoice_id
                ))
            })?;

        if item.is_dismissed {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(invoice);
        }
        item.is_dismissed = true;

        invoice.recompute(today);
        ensure_non_negative_total(&invoice)?;

        sqlx::query("UPDATE invoice_items SET is_dismissed = TRUE WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to dismiss invoice item"))?;
        Self::save_invoice(&mut tx, &invoice).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(invoice_id = %invoice_id, item_id = %item_id, "Invoice item dismissed");

        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn mark_overdue(&self, school_id: Uuid, as_of: NaiveDate) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_overdue"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices SET status = 'OVERDUE'
            WHERE school_id = $1
              AND status IN ('PENDING', 'PARTIALLY_PAID')
              AND due_date < $2
            "#,
        )
        .bind(school_id)
        .bind(as_of)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark overdue invoices"))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(student_id = %input.student_id, amount = %input.amount))]
    async fn record_payment(&self, input: &NewPayment, today: NaiveDate) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut invoice = match input.invoice_id {
            Some(invoice_id) => {
                let invoice = Self::lock_invoice(&mut tx, input.school_id, invoice_id).await?;
                if invoice.student_id != input.student_id {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Invoice {} does not belong to student {}",
                        invoice_id,
                        input.student_id
                    )));
                }
                if invoice.status == InvoiceStatus::Cancelled {
                    return Err(invoice_cancelled(invoice_id));
                }
                Some(invoice)
            }
            None => None,
        };

        let now = Utc::now();
        let completed_utc = (input.status == PaymentStatus::Completed).then_some(now);

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (payment_id, school_id, student_id, invoice_id, amount, method, status,
                reference, phone_number, checkout_request_id, recorded_by, created_utc, completed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING payment_id, school_id, student_id, invoice_id, amount, method, status, reference,
                phone_number, checkout_request_id, gateway_transaction_id, recorded_by, created_utc, completed_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(input.student_id)
        .bind(input.invoice_id)
        .bind(input.amount)
        .bind(input.method.as_str())
        .bind(input.status.as_str())
        .bind(&input.reference)
        .bind(&input.phone_number)
        .bind(&input.checkout_request_id)
        .bind(&input.recorded_by)
        .bind(now)
        .bind(completed_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("Duplicate checkout request id"))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record payment: {}", e))
            }
        })?;

        if payment.status == PaymentStatus::Completed {
            if let Some(invoice) = invoice.as_mut() {
                invoice.apply_payment(payment.amount, today);
                Self::save_invoice(&mut tx, invoice).await?;
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            payment_id = %payment.payment_id,
            method = payment.method.as_str(),
            status = payment.status.as_str(),
            "Payment recorded"
        );

        Ok(payment)
    }

    #[instrument(skip(self, filter))]
    async fn list_payments(
        &self,
        school_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let status_str = filter.status.map(|s| s.as_str().to_string());

        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, school_id, student_id, invoice_id, amount, method, status, reference,
                phone_number, checkout_request_id, gateway_transaction_id, recorded_by, created_utc, completed_utc
            FROM payments
            WHERE school_id = $1
              AND ($2::uuid IS NULL OR student_id = $2)
              AND ($3::uuid IS NULL OR invoice_id = $3)
              AND ($4::varchar IS NULL OR status = $4)
            ORDER BY created_utc DESC, payment_id
            "#,
        )
        .bind(school_id)
        .bind(filter.student_id)
        .bind(filter.invoice_id)
        .bind(&status_str)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list payments"))?;

        timer.observe_duration();

        Ok(payments)
    }

    #[instrument(skip(self))]
    async fn get_payment_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_by_checkout"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, school_id, student_id, invoice_id, amount, method, status, reference,
                phone_number, checkout_request_id, gateway_transaction_id, recorded_by, created_utc, completed_utc
            FROM payments
            WHERE checkout_request_id = $1
            "#,
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get payment"))?;

        timer.observe_duration();

        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn complete_mobile_payment(
        &self,
        checkout_request_id: &str,
        gateway_transaction_id: &str,
        completed_at: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<(Payment, CallbackOutcome), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_mobile_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let pending = Self::lock_payment_by_checkout(&mut tx, checkout_request_id).await?;
        match pending.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed => {
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok((pending, CallbackOutcome::Duplicate));
            }
            other => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Payment for checkout {} is {}",
                    checkout_request_id,
                    other.as_str()
                )));
            }
        }

        let reused = sqlx::query_scalar::<_, Uuid>(
            "SELECT payment_id FROM payments WHERE gateway_transaction_id = $1",
        )
        .bind(gateway_transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to check gateway transaction"))?;
        if let Some(payment_id) = reused {
            warn!(
                payment_id = %payment_id,
                gateway_transaction_id = %gateway_transaction_id,
                "Gateway transaction already reconciled against another payment"
            );
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Gateway transaction {} was already reconciled",
                gateway_transaction_id
            )));
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'COMPLETED', gateway_transaction_id = $2, completed_utc = $3
            WHERE payment_id = $1 AND status = 'PENDING'
            RETURNING payment_id, school_id, student_id, invoice_id, amount, method, status, reference,
                phone_number, checkout_request_id, gateway_transaction_id, recorded_by, created_utc, completed_utc
            "#,
        )
        .bind(pending.payment_id)
        .bind(gateway_transaction_id)
        .bind(completed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(transaction_reuse_error(gateway_transaction_id))?;

        if let Some(invoice_id) = payment.invoice_id {
            let mut invoice = Self::lock_invoice(&mut tx, payment.school_id, invoice_id).await?;
            if invoice.status == InvoiceStatus::Cancelled {
                warn!(
                    invoice_id = %invoice_id,
                    payment_id = %payment.payment_id,
                    "Mobile payment completed against a cancelled invoice; left unapplied"
                );
            } else {
                invoice.apply_payment(payment.amount, today);
                Self::save_invoice(&mut tx, &invoice).await?;
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok((payment, CallbackOutcome::Applied))
    }

    #[instrument(skip(self))]
    async fn fail_mobile_payment(
        &self,
        checkout_request_id: &str,
    ) -> Result<(Payment, CallbackOutcome), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_mobile_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let pending = Self::lock_payment_by_checkout(&mut tx, checkout_request_id).await?;
        if pending.status != PaymentStatus::Pending {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok((pending, CallbackOutcome::Duplicate));
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET status = 'FAILED'
            WHERE payment_id = $1 AND status = 'PENDING'
            RETURNING payment_id, school_id, student_id, invoice_id, amount, method, status, reference,
                phone_number, checkout_request_id, gateway_transaction_id, recorded_by, created_utc, completed_utc
            "#,
        )
        .bind(pending.payment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to mark payment failed"))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok((payment, CallbackOutcome::Failed))
    }

    // -------------------------------------------------------------------------
    // Approval requests
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(school_id = %input.school_id, request_type = input.payload.request_type().as_str()))]
    async fn create_approval(
        &self,
        input: &NewApprovalRequest,
    ) -> Result<ApprovalRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_approval"])
            .start_timer();

        let request_type = input.payload.request_type();
        let request = sqlx::query_as::<_, ApprovalRequest>(
            r#"
            INSERT INTO approval_requests (request_id, school_id, request_type, invoice_id, payload, reason, requested_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING request_id, school_id, request_type, invoice_id, payload, reason, status,
                requested_by, approved_by, resolution_note, created_utc, resolved_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.school_id)
        .bind(request_type.as_str())
        .bind(input.payload.invoice_id())
        .bind(Json(&input.payload))
        .bind(&input.reason)
        .bind(&input.requested_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "A pending {} request already exists for invoice {}",
                    request_type.as_str(),
                    input.payload.invoice_id()
                ))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create approval request: {}", e))
            }
        })?;

        timer.observe_duration();

        info!(request_id = %request.request_id, "Approval request created");

        Ok(request)
    }

    #[instrument(skip(self))]
    async fn get_approval(
        &self,
        school_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<ApprovalRequest>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_approval"])
            .start_timer();

        let request = sqlx::query_as::<_, ApprovalRequest>(
            r#"
            SELECT request_id, school_id, request_type, invoice_id, payload, reason, status,
                requested_by, approved_by, resolution_note, created_utc, resolved_utc
            FROM approval_requests
            WHERE school_id = $1 AND request_id = $2
            "#,
        )
        .bind(school_id)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get approval request"))?;

        timer.observe_duration();

        Ok(request)
    }

    #[instrument(skip(self, filter))]
    async fn list_approvals(
        &self,
        school_id: Uuid,
        filter: &ListApprovalsFilter,
    ) -> Result<Vec<ApprovalRequest>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_approvals"])
            .start_timer();

        let status_str = filter.status.map(|s| s.as_str().to_string());

        let requests = sqlx::query_as::<_, ApprovalRequest>(
            r#"
            SELECT request_id, school_id, request_type, invoice_id, payload, reason, status,
                requested_by, approved_by, resolution_note, created_utc, resolved_utc
            FROM approval_requests
            WHERE school_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR invoice_id = $3)
            ORDER BY created_utc DESC, request_id
            "#,
        )
        .bind(school_id)
        .bind(&status_str)
        .bind(filter.invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list approval requests"))?;

        timer.observe_duration();

        Ok(requests)
    }

    #[instrument(skip(self, decision), fields(status = decision.status.as_str(), resolved_by = %decision.resolved_by))]
    async fn resolve_approval(
        &self,
        school_id: Uuid,
        request_id: Uuid,
        decision: &ApprovalDecision,
        today: NaiveDate,
    ) -> Result<ApprovalRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_approval"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let request = sqlx::query_as::<_, ApprovalRequest>(
            r#"
            SELECT request_id, school_id, request_type, invoice_id, payload, reason, status,
                requested_by, approved_by, resolution_note, created_utc, resolved_utc
            FROM approval_requests
            WHERE school_id = $1 AND request_id = $2
            FOR UPDATE
            "#,
        )
        .bind(school_id)
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock approval request"))?
        .ok_or_else(|| approval_not_found(request_id))?;

        if request.status != ApprovalStatus::Pending {
            return Err(approval_already_resolved(request_id));
        }

        if decision.status == ApprovalStatus::Approved {
            let mut invoice = Self::lock_invoice(&mut tx, school_id, request.invoice_id).await?;
            if invoice.status == InvoiceStatus::Cancelled {
                return Err(invoice_cancelled(invoice.invoice_id));
            }

            match &request.payload.0 {
                ApprovalPayload::InvoiceCancellation { .. } => {
                    invoice.cancel(decision.at);
                }
                ApprovalPayload::BalanceAdjustment(proposal) => {
                    if invoice.total_amount != proposal.previous_total
                        || invoice.paid_amount != proposal.previous_paid
                    {
                        return Err(proposal_outdated(invoice.invoice_id));
                    }
                    let item = NewInvoiceItem {
                        description: proposal.description.clone(),
                        amount: proposal.amount,
                        category: FeeCategory::Adjustment,
                        fee_structure_id: None,
                    };
                    let sort_order = next_sort_order(&invoice.items);
                    let inserted =
                        Self::insert_item(&mut tx, invoice.invoice_id, &item, sort_order).await?;
                    invoice.items.push(inserted);
                    invoice.total_amount = proposal.new_total;
                    invoice.balance = proposal.new_balance;
                    invoice.status = derive_status(
                        invoice.status,
                        invoice.total_amount,
                        invoice.paid_amount,
                        invoice.due_date,
                        today,
                    );
                }
            }

            Self::save_invoice(&mut tx, &invoice).await?;
        }

        let resolved = sqlx::query_as::<_, ApprovalRequest>(
            r#"
            UPDATE approval_requests
            SET status = $2, approved_by = $3, resolution_note = $4, resolved_utc = $5
            WHERE request_id = $1 AND status = 'PENDING'
            RETURNING request_id, school_id, request_type, invoice_id, payload, reason, status,
                requested_by, approved_by, resolution_note, created_utc, resolved_utc
            "#,
        )
        .bind(request_id)
        .bind(decision.status.as_str())
        .bind(&decision.resolved_by)
        .bind(&decision.note)
        .bind(decision.at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to resolve approval request"))?
        .ok_or_else(|| approval_already_resolved(request_id))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            request_id = %request_id,
            status = resolved.status.as_str(),
            "Approval request resolved"
        );

        Ok(resolved)
    }

    // -------------------------------------------------------------------------
    // Impersonation sessions
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(actor_id = %input.actor_id, target_user_id = %input.target_user_id))]
    async fn create_impersonation(
        &self,
        input: &NewImpersonationSession,
    ) -> Result<ImpersonationSession, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_impersonation"])
            .start_timer();

        let session = sqlx::query_as::<_, ImpersonationSession>(
            r#"
            INSERT INTO impersonation_sessions (session_id, token, actor_id, target_user_id, target_school_id,
                target_role, reason, issued_utc, expires_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING session_id, token, actor_id, target_user_id, target_school_id, target_role, reason,
                issued_utc, expires_utc, revoked_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.token)
        .bind(&input.actor_id)
        .bind(&input.target_user_id)
        .bind(input.target_school_id)
        .bind(input.target_role.as_str())
        .bind(&input.reason)
        .bind(input.issued_utc)
        .bind(input.expires_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create impersonation session"))?;

        timer.observe_duration();

        Ok(session)
    }

    #[instrument(skip(self, token))]
    async fn get_impersonation(
        &self,
        token: &str,
    ) -> Result<Option<ImpersonationSession>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_impersonation"])
            .start_timer();

        let session = sqlx::query_as::<_, ImpersonationSession>(
            r#"
            SELECT session_id, token, actor_id, target_user_id, target_school_id, target_role, reason,
                issued_utc, expires_utc, revoked_utc
            FROM impersonation_sessions
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get impersonation session"))?;

        timer.observe_duration();

        Ok(session)
    }

    #[instrument(skip(self, token))]
    async fn revoke_impersonation(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ImpersonationSession>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["revoke_impersonation"])
            .start_timer();

        let session = sqlx::query_as::<_, ImpersonationSession>(
            r#"
            UPDATE impersonation_sessions SET revoked_utc = COALESCE(revoked_utc, $2)
            WHERE token = $1
            RETURNING session_id, token, actor_id, target_user_id, target_school_id, target_role, reason,
                issued_utc, expires_utc, revoked_utc
            "#,
        )
        .bind(token)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to revoke impersonation session"))?;

        timer.observe_duration();

        Ok(session)
    }

    #[instrument(skip(self))]
    async fn list_impersonations(&self) -> Result<Vec<ImpersonationSession>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_impersonations"])
            .start_timer();

        let sessions = sqlx::query_as::<_, ImpersonationSession>(
            r#"
            SELECT session_id, token, actor_id, target_user_id, target_school_id, target_role, reason,
                issued_utc, expires_utc, revoked_utc
            FROM impersonation_sessions
            ORDER BY issued_utc DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list impersonation sessions"))?;

        timer.observe_duration();

        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::error::Error as StdError;

    #[derive(Debug)]
    struct ConstraintError {
        unique: bool,
    }

    impl std::fmt::Display for ConstraintError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "constraint violated")
        }
    }

    impl StdError for ConstraintError {}

    impl DatabaseError for ConstraintError {
        fn message(&self) -> &str {
            "constraint violated"
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            if self.unique {
                ErrorKind::UniqueViolation
            } else {
                ErrorKind::Other
            }
        }
    }

    #[test]
    fn racing_transaction_reuse_is_a_conflict() {
        let err = sqlx::Error::Database(Box::new(ConstraintError { unique: true }));
        let mapped = transaction_reuse_error("QK12ABC")(err);
        assert!(matches!(mapped, AppError::Conflict(_)));

        let err = sqlx::Error::Database(Box::new(ConstraintError { unique: false }));
        let mapped = transaction_reuse_error("QK12ABC")(err);
        assert!(matches!(mapped, AppError::DatabaseError(_)));

        let mapped = transaction_reuse_error("QK12ABC")(sqlx::Error::RowNotFound);
        assert!(matches!(mapped, AppError::DatabaseError(_)));
    }
}
