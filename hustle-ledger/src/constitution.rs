//! Storage constitution
//!
//! The relational schema plus the trigger layer that enforces the money
//! invariants below the application: terminal rows are immutable, escrow
//! amounts are frozen, audit ledgers are append-only, ledger transactions
//! only move forward through their status machine, and entries re-balance
//! to zero at commit. Application code that violates any of these gets a
//! `RAISE EXCEPTION` whose message starts with the invariant tag, which the
//! error taxonomy maps back to `InvariantViolation`.

use sqlx::PgPool;
use tracing::info;

use hustle_core::CoreResult;

/// Run the idempotent schema migration. Safe to call on every boot.
pub async fn migrate(pool: &PgPool) -> CoreResult<()> {
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    info!("storage constitution applied");
    Ok(())
}

const STATEMENTS: &[&str] = &[
    // ── Users & tasks ─────────────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL DEFAULT 'user',
        trust_tier SMALLINT NOT NULL DEFAULT 1,
        xp_total BIGINT NOT NULL DEFAULT 0,
        streak_days INT NOT NULL DEFAULT 0,
        completed_tasks INT NOT NULL DEFAULT 0,
        disputes_lost INT NOT NULL DEFAULT 0,
        avg_rating DOUBLE PRECISION,
        sla_breach_open BOOLEAN NOT NULL DEFAULT FALSE,
        stripe_account_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT "INV-TRUST-BOUNDS" CHECK (trust_tier BETWEEN 1 AND 4)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id UUID PRIMARY KEY,
        poster_id UUID NOT NULL REFERENCES users(id),
        worker_id UUID REFERENCES users(id),
        price_cents BIGINT NOT NULL CHECK (price_cents > 0),
        state TEXT NOT NULL CHECK (state IN
            ('open', 'accepted', 'proof_submitted', 'disputed',
             'completed', 'cancelled', 'expired')),
        category TEXT NOT NULL DEFAULT 'general',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS escrows (
        task_id UUID PRIMARY KEY REFERENCES tasks(id),
        state TEXT NOT NULL CHECK (state IN
            ('pending', 'funded', 'held', 'released', 'refunded', 'pending_dispute')),
        amount_cents BIGINT NOT NULL CHECK (amount_cents > 0),
        stripe_payment_intent_id TEXT,
        stripe_charge_id TEXT,
        version BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS proofs (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL REFERENCES tasks(id),
        worker_id UUID NOT NULL REFERENCES users(id),
        state TEXT NOT NULL CHECK (state IN
            ('requested', 'submitted', 'analyzing', 'verified',
             'rejected', 'escalated', 'locked')),
        forensics JSONB NOT NULL DEFAULT '{}',
        submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        decided_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_proofs_task ON proofs(task_id, submitted_at DESC)
    "#,
    // Canonical pointer for escrow/money status; always read FOR UPDATE.
    r#"
    CREATE TABLE IF NOT EXISTS money_state_lock (
        task_id UUID PRIMARY KEY REFERENCES tasks(id),
        current_state TEXT NOT NULL,
        next_allowed_events TEXT[] NOT NULL DEFAULT '{}',
        version BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS state_transition_log (
        id BIGSERIAL PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id UUID NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        context JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transition_log_entity
    ON state_transition_log(entity_type, entity_id, created_at)
    "#,
    // ── Ledger ────────────────────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS ledger_accounts (
        id UUID PRIMARY KEY,
        owner_type TEXT NOT NULL CHECK (owner_type IN ('platform', 'user', 'task')),
        owner_id UUID,
        account_type TEXT NOT NULL CHECK (account_type IN
            ('asset', 'liability', 'equity', 'expense')),
        currency TEXT NOT NULL DEFAULT 'USD',
        balance_cents BIGINT NOT NULL DEFAULT 0,
        baseline_balance BIGINT NOT NULL DEFAULT 0,
        baseline_ulid TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_transactions (
        id TEXT PRIMARY KEY,
        tx_type TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN
            ('pending', 'executing', 'committed', 'confirmed', 'failed')),
        idempotency_key TEXT NOT NULL UNIQUE,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        committed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        id BIGSERIAL PRIMARY KEY,
        tx_id TEXT NOT NULL REFERENCES ledger_transactions(id),
        account_id UUID NOT NULL REFERENCES ledger_accounts(id),
        direction TEXT NOT NULL CHECK (direction IN ('debit', 'credit')),
        amount_cents BIGINT NOT NULL CHECK (amount_cents > 0)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_ledger_entries_tx ON ledger_entries(tx_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_ledger_entries_account ON ledger_entries(account_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_sequence (
        seq BIGSERIAL PRIMARY KEY,
        tx_id TEXT NOT NULL UNIQUE REFERENCES ledger_transactions(id),
        tx_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_snapshots (
        account_id UUID PRIMARY KEY REFERENCES ledger_accounts(id),
        balance_cents BIGINT NOT NULL,
        last_tx_ulid TEXT NOT NULL,
        snapshot_hash TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ── Outbox, DLQ, webhooks, provider log ───────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        aggregate_type TEXT NOT NULL,
        aggregate_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        queue_name TEXT NOT NULL,
        claimed_at TIMESTAMPTZ,
        published_at TIMESTAMPTZ,
        attempts INT NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_pending
    ON outbox_events(queue_name, created_at)
    WHERE published_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letter_queue (
        id BIGSERIAL PRIMARY KEY,
        queue TEXT NOT NULL,
        payload JSONB NOT NULL,
        first_failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_error TEXT NOT NULL,
        attempts INT NOT NULL DEFAULT 0,
        resolved_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_webhooks (
        event_id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        body_hash TEXT NOT NULL,
        result TEXT NOT NULL CHECK (result IN ('processing', 'ok', 'failed')),
        error_message TEXT,
        claimed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stripe_outbound_log (
        idempotency_key TEXT PRIMARY KEY,
        stripe_id TEXT NOT NULL,
        request_type TEXT NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ── Trust, XP, badges, admin audit ────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS xp_ledger (
        id BIGSERIAL PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        escrow_id UUID NOT NULL,
        base_xp BIGINT NOT NULL,
        decay_factor NUMERIC(10, 4) NOT NULL,
        streak_mult NUMERIC(4, 2) NOT NULL,
        final_xp BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT "INV-5" UNIQUE (escrow_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trust_ledger (
        id BIGSERIAL PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        old_tier SMALLINT NOT NULL CHECK (old_tier BETWEEN 1 AND 4),
        new_tier SMALLINT NOT NULL CHECK (new_tier BETWEEN 1 AND 4),
        reason TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        task_id UUID,
        idempotency_key TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS badge_ledger (
        id BIGSERIAL PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        badge TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS admin_action_ledger (
        id BIGSERIAL PRIMARY KEY,
        admin_id UUID NOT NULL,
        action TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        context JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ── API idempotency, safety flags, conflict log ───────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        key TEXT PRIMARY KEY,
        request_hash TEXT NOT NULL,
        response_status INT,
        response_body JSONB,
        locked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS killswitch (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        active BOOLEAN NOT NULL DEFAULT FALSE,
        reason TEXT,
        activated_at TIMESTAMPTZ
    )
    "#,
    r#"
    INSERT INTO killswitch (id, active) VALUES (1, FALSE) ON CONFLICT (id) DO NOTHING
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS safe_mode (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        active BOOLEAN NOT NULL DEFAULT FALSE,
        reason TEXT,
        correction_class TEXT,
        activated_at TIMESTAMPTZ
    )
    "#,
    r#"
    INSERT INTO safe_mode (id, active) VALUES (1, FALSE) ON CONFLICT (id) DO NOTHING
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS admin_denylist (
        user_id UUID PRIMARY KEY,
        reason TEXT NOT NULL,
        emergency BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conflict_log (
        id BIGSERIAL PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id UUID NOT NULL,
        attempted_event TEXT NOT NULL,
        from_state TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ── Trigger layer ─────────────────────────────────────────────────────
    // INV-TERMINAL: rows already in a terminal state never change again.
    r#"
    CREATE OR REPLACE FUNCTION enforce_task_terminal() RETURNS TRIGGER AS $$
    BEGIN
        IF OLD.state IN ('completed', 'cancelled', 'expired') THEN
            RAISE EXCEPTION 'INV-TERMINAL: task % is terminal (%)', OLD.id, OLD.state;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_task_terminal ON tasks"#,
    r#"
    CREATE TRIGGER trg_task_terminal
    BEFORE UPDATE ON tasks
    FOR EACH ROW EXECUTE FUNCTION enforce_task_terminal()
    "#,
    r#"
    CREATE OR REPLACE FUNCTION enforce_escrow_rules() RETURNS TRIGGER AS $$
    BEGIN
        IF OLD.state IN ('released', 'refunded') THEN
            RAISE EXCEPTION 'INV-TERMINAL: escrow % is terminal (%)', OLD.task_id, OLD.state;
        END IF;
        IF NEW.amount_cents IS DISTINCT FROM OLD.amount_cents THEN
            RAISE EXCEPTION 'INV-AMOUNT-IMMUTABLE: escrow % amount is frozen', OLD.task_id;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_escrow_rules ON escrows"#,
    r#"
    CREATE TRIGGER trg_escrow_rules
    BEFORE UPDATE ON escrows
    FOR EACH ROW EXECUTE FUNCTION enforce_escrow_rules()
    "#,
    r#"
    CREATE OR REPLACE FUNCTION enforce_proof_terminal() RETURNS TRIGGER AS $$
    BEGIN
        IF OLD.state = 'locked' THEN
            RAISE EXCEPTION 'INV-TERMINAL: proof % is terminal (locked)', OLD.id;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_proof_terminal ON proofs"#,
    r#"
    CREATE TRIGGER trg_proof_terminal
    BEFORE UPDATE ON proofs
    FOR EACH ROW EXECUTE FUNCTION enforce_proof_terminal()
    "#,
    // INV-APPEND-ONLY: audit ledgers accept inserts only.
    r#"
    CREATE OR REPLACE FUNCTION enforce_append_only() RETURNS TRIGGER AS $$
    BEGIN
        RAISE EXCEPTION 'INV-APPEND-ONLY: % rows cannot be % ', TG_TABLE_NAME, TG_OP;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_xp ON xp_ledger"#,
    r#"
    CREATE TRIGGER trg_append_only_xp
    BEFORE UPDATE OR DELETE ON xp_ledger
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_trust ON trust_ledger"#,
    r#"
    CREATE TRIGGER trg_append_only_trust
    BEFORE UPDATE OR DELETE ON trust_ledger
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_badge ON badge_ledger"#,
    r#"
    CREATE TRIGGER trg_append_only_badge
    BEFORE UPDATE OR DELETE ON badge_ledger
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_admin ON admin_action_ledger"#,
    r#"
    CREATE TRIGGER trg_append_only_admin
    BEFORE UPDATE OR DELETE ON admin_action_ledger
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_transition ON state_transition_log"#,
    r#"
    CREATE TRIGGER trg_append_only_transition
    BEFORE UPDATE OR DELETE ON state_transition_log
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_entries ON ledger_entries"#,
    r#"
    CREATE TRIGGER trg_append_only_entries
    BEFORE UPDATE OR DELETE ON ledger_entries
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    r#"DROP TRIGGER IF EXISTS trg_append_only_sequence ON ledger_sequence"#,
    r#"
    CREATE TRIGGER trg_append_only_sequence
    BEFORE UPDATE OR DELETE ON ledger_sequence
    FOR EACH ROW EXECUTE FUNCTION enforce_append_only()
    "#,
    // Ledger transaction rows only move forward; never deletable.
    r#"
    CREATE OR REPLACE FUNCTION enforce_ledger_tx_status() RETURNS TRIGGER AS $$
    BEGIN
        IF TG_OP = 'DELETE' THEN
            RAISE EXCEPTION 'INV-APPEND-ONLY: ledger_transactions rows cannot be deleted';
        END IF;
        IF OLD.status IN ('confirmed', 'failed') THEN
            RAISE EXCEPTION 'INV-TERMINAL: ledger tx % is terminal (%)', OLD.id, OLD.status;
        END IF;
        IF OLD.status = NEW.status THEN
            RETURN NEW;
        END IF;
        IF (OLD.status = 'pending' AND NEW.status IN ('executing', 'failed'))
            OR (OLD.status = 'executing' AND NEW.status IN ('committed', 'failed'))
            OR (OLD.status = 'committed' AND NEW.status = 'confirmed') THEN
            RETURN NEW;
        END IF;
        RAISE EXCEPTION 'INV-TX-STATUS: illegal ledger tx move % -> %', OLD.status, NEW.status;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_ledger_tx_status ON ledger_transactions"#,
    r#"
    CREATE TRIGGER trg_ledger_tx_status
    BEFORE UPDATE OR DELETE ON ledger_transactions
    FOR EACH ROW EXECUTE FUNCTION enforce_ledger_tx_status()
    "#,
    // INV-2 / INV-3: completion requires a released escrow and an accepted
    // proof. Deferred so the release transaction may order its writes freely.
    r#"
    CREATE OR REPLACE FUNCTION enforce_task_completion_chain() RETURNS TRIGGER AS $$
    BEGIN
        IF NEW.state = 'completed' THEN
            IF NOT EXISTS (
                SELECT 1 FROM escrows WHERE task_id = NEW.id AND state = 'released'
            ) THEN
                RAISE EXCEPTION 'INV-2: task % completed without a released escrow', NEW.id;
            END IF;
            IF NOT EXISTS (
                SELECT 1 FROM proofs WHERE task_id = NEW.id AND state IN ('verified', 'locked')
            ) THEN
                RAISE EXCEPTION 'INV-3: task % completed without an accepted proof', NEW.id;
            END IF;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_task_completion_chain ON tasks"#,
    r#"
    CREATE CONSTRAINT TRIGGER trg_task_completion_chain
    AFTER UPDATE ON tasks
    DEFERRABLE INITIALLY DEFERRED
    FOR EACH ROW EXECUTE FUNCTION enforce_task_completion_chain()
    "#,
    // INV-4: deferred re-check that each transaction's entries are balanced
    // and even-numbered (>= 2) at commit time.
    r#"
    CREATE OR REPLACE FUNCTION enforce_zero_sum() RETURNS TRIGGER AS $$
    DECLARE
        n_entries BIGINT;
        net BIGINT;
    BEGIN
        SELECT COUNT(*),
               COALESCE(SUM(CASE WHEN direction = 'debit'
                                 THEN amount_cents ELSE -amount_cents END), 0)
        INTO n_entries, net
        FROM ledger_entries
        WHERE tx_id = NEW.tx_id;

        IF n_entries < 2 OR n_entries % 2 <> 0 THEN
            RAISE EXCEPTION 'INV-4: tx % has % entries (need even >= 2)', NEW.tx_id, n_entries;
        END IF;
        IF net <> 0 THEN
            RAISE EXCEPTION 'INV-4: tx % entries sum to % cents (need 0)', NEW.tx_id, net;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS trg_zero_sum ON ledger_entries"#,
    r#"
    CREATE CONSTRAINT TRIGGER trg_zero_sum
    AFTER INSERT ON ledger_entries
    DEFERRABLE INITIALLY DEFERRED
    FOR EACH ROW EXECUTE FUNCTION enforce_zero_sum()
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_single_and_nonempty() {
        for s in STATEMENTS {
            assert!(!s.trim().is_empty());
            // Dollar-quoted function bodies aside, no statement should carry
            // a trailing second statement.
            let body_free = {
                let mut out = String::new();
                let mut in_dollar = false;
                let mut rest = *s;
                while let Some(pos) = rest.find("$$") {
                    if !in_dollar {
                        out.push_str(&rest[..pos]);
                    }
                    in_dollar = !in_dollar;
                    rest = &rest[pos + 2..];
                }
                out.push_str(if in_dollar { "" } else { rest });
                out
            };
            assert!(
                !body_free.trim_end().trim_end_matches(';').contains(';'),
                "multiple statements in one entry: {s}"
            );
        }
    }

    #[test]
    fn invariant_tags_present() {
        let all = STATEMENTS.join("\n");
        for tag in [
            "INV-TERMINAL",
            "INV-AMOUNT-IMMUTABLE",
            "INV-APPEND-ONLY",
            "INV-2",
            "INV-3",
            "INV-4",
            "INV-5",
            "INV-TRUST-BOUNDS",
        ] {
            assert!(all.contains(tag), "missing {tag} in constitution");
        }
    }
}
