//! CSV projections of a school's finance data.

use std::collections::HashMap;

use uuid::Uuid;

use crate::models::{Invoice, Payment, Student};

pub const INVOICE_HEADER: &[&str] = &[
    "invoice_number",
    "admission_number",
    "student_name",
    "total_amount",
    "paid_amount",
    "balance",
    "status",
    "due_date",
    "created_utc",
];

pub const PAYMENT_HEADER: &[&str] = &[
    "payment_id",
    "admission_number",
    "student_name",
    "amount",
    "method",
    "status",
    "reference",
    "gateway_transaction_id",
    "created_utc",
    "completed_utc",
];

pub const STUDENT_HEADER: &[&str] = &[
    "admission_number",
    "first_name",
    "last_name",
    "class",
    "active",
    "parent_user_id",
];

/// Quote a field per RFC 4180 when it contains a delimiter, quote or line break.
pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn push_row<S: AsRef<str>>(out: &mut String, fields: &[S]) {
    let line = fields
        .iter()
        .map(|field| csv_quote(field.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    out.push_str(&line);
    out.push_str("\r\n");
}

fn student_columns(students: &HashMap<Uuid, &Student>, student_id: Uuid) -> (String, String) {
    students
        .get(&student_id)
        .map(|s| (s.admission_number.clone(), s.full_name()))
        .unwrap_or_default()
}

fn index_students(students: &[Student]) -> HashMap<Uuid, &Student> {
    students.iter().map(|s| (s.student_id, s)).collect()
}

pub fn invoices_csv(invoices: &[Invoice], students: &[Student]) -> String {
    let students = index_students(students);
    let mut out = String::new();
    push_row(&mut out, INVOICE_HEADER);
    for invoice in invoices {
        let (admission_number, name) = student_columns(&students, invoice.student_id);
        push_row(
            &mut out,
            &[
                invoice.invoice_number.clone(),
                admission_number,
                name,
                invoice.total_amount.to_string(),
                invoice.paid_amount.to_string(),
                invoice.balance.to_string(),
                invoice.status.as_str().to_string(),
                invoice.due_date.to_string(),
                invoice.created_utc.to_rfc3339(),
            ],
        );
    }
    out
}

pub fn payments_csv(payments: &[Payment], students: &[Student]) -> String {
    let students = index_students(students);
    let mut out = String::new();
    push_row(&mut out, PAYMENT_HEADER);
    for payment in payments {
        let (admission_number, name) = student_columns(&students, payment.student_id);
        push_row(
            &mut out,
            &[
                payment.payment_id.to_string(),
                admission_number,
                name,
                payment.amount.to_string(),
                payment.method.as_str().to_string(),
                payment.status.as_str().to_string(),
                payment.reference.clone().unwrap_or_default(),
                payment.gateway_transaction_id.clone().unwrap_or_default(),
                payment.created_utc.to_rfc3339(),
                payment
                    .completed_utc
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default(),
            ],
        );
    }
    out
}

pub fn students_csv(students: &[Student], class_names: &HashMap<Uuid, String>) -> String {
    let mut out = String::new();
    push_row(&mut out, STUDENT_HEADER);
    for student in students {
        push_row(
            &mut out,
            &[
                student.admission_number.clone(),
                student.first_name.clone(),
                student.last_name.clone(),
                class_names.get(&student.class_id).cloned().unwrap_or_default(),
                student.active.to_string(),
                student.parent_user_id.clone().unwrap_or_default(),
            ],
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn plain_fields_are_left_alone() {
        assert_eq!(csv_quote("Grade 4"), "Grade 4");
    }

    #[test]
    fn delimiters_quotes_and_newlines_are_quoted() {
        assert_eq!(csv_quote("Otieno, Amani"), "\"Otieno, Amani\"");
        assert_eq!(csv_quote("the \"big\" fee"), "\"the \"\"big\"\" fee\"");
        assert_eq!(csv_quote("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn student_rows_resolve_class_names() {
        let class_id = Uuid::new_v4();
        let student = Student {
            student_id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
            class_id,
            admission_number: "ADM-7".to_string(),
            first_name: "Wanjiru".to_string(),
            last_name: "Kamau, Jr".to_string(),
            parent_user_id: None,
            active: true,
            created_utc: Utc::now(),
        };
        let classes = HashMap::from([(class_id, "Grade 2".to_string())]);

        let csv = students_csv(&[student], &classes);
        let lines: Vec<&str> = csv.split("\r\n").collect();

        assert_eq!(lines[0], STUDENT_HEADER.join(","));
        assert_eq!(lines[1], "ADM-7,Wanjiru,\"Kamau, Jr\",Grade 2,true,");
    }
}
