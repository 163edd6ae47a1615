use imap_proto::parser::parse_response;
use imap_proto::types::Response;
use mailkeeper::imap::decode::{decode_fetch, FetchParts};
use mailkeeper::types::FetchedEmail;

fn decode(raw: &[u8]) -> FetchedEmail {
    let (rest, resp) = parse_response(raw).unwrap();
    assert!(rest.is_empty());

    match resp {
        Response::Fetch(_, attrs) => decode_fetch(&FetchParts::from_attributes(&attrs)).unwrap(),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[test]
fn decodes_envelope_flags_and_nested_attachments() {
    let email = decode(
        b"* 12 FETCH (UID 4021 FLAGS (\\Seen \\Answered) RFC822.SIZE 48213 \
INTERNALDATE \"17-Jul-2025 02:44:25 -0700\" \
ENVELOPE (\"Thu, 17 Jul 2025 09:30:00 +0000\" \"=?UTF-8?B?UXVhcnRlcmx5IHJlcG9ydA==?=\" \
((\"Alice Smith\" NIL \"alice\" \"example.com\")) ((\"Alice Smith\" NIL \"alice\" \"example.com\")) NIL \
((\"Bob\" NIL \"bob\" \"example.org\")(NIL NIL \"carol\" \"example.org\")) ((NIL NIL \"dave\" \"example.net\")) \
NIL \"<parent@example.com>\" \"<report-1@example.com>\") \
BODYSTRUCTURE (((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" 12 1 NIL NIL NIL NIL)\
(\"TEXT\" \"HTML\" (\"CHARSET\" \"utf-8\") NIL NIL \"QUOTED-PRINTABLE\" 40 2 NIL NIL NIL NIL) \
\"ALTERNATIVE\" (\"BOUNDARY\" \"alt\") NIL NIL NIL)\
(\"APPLICATION\" \"PDF\" (\"NAME\" \"q3.pdf\") NIL NIL \"BASE64\" 40960 NIL (\"ATTACHMENT\" (\"FILENAME\" \"q3.pdf\")) NIL NIL)\
(\"IMAGE\" \"PNG\" NIL \"<logo@example.com>\" NIL \"BASE64\" 2048 NIL (\"INLINE\" NIL) NIL NIL) \
\"MIXED\" (\"BOUNDARY\" \"mix\") NIL NIL NIL))\r\n",
    );

    assert_eq!(email.uid, 4021);
    assert_eq!(email.message_id, "report-1@example.com");
    assert_eq!(email.in_reply_to, "parent@example.com");
    assert_eq!(email.subject, "Quarterly report");
    assert_eq!(email.from_name, "Alice Smith");
    assert_eq!(email.from_email, "alice@example.com");
    assert_eq!(email.to_addrs, "Bob <bob@example.org>, carol@example.org");
    assert_eq!(email.cc_addrs, "dave@example.net");
    assert_eq!(email.date, Some(1_752_744_600));
    assert_eq!(email.size_bytes, 48213);
    assert!(email.flags.read);
    assert!(email.flags.replied);
    assert!(!email.flags.starred);

    assert!(email.has_attachments);
    assert_eq!(email.attachments.len(), 2);

    let pdf = &email.attachments[0];
    assert_eq!(pdf.part_number, "2");
    assert_eq!(pdf.filename, "q3.pdf");
    assert_eq!(pdf.content_type, "application/pdf");
    assert_eq!(pdf.encoding, "base64");
    assert_eq!(pdf.size, 40960);
    assert!(!pdf.is_inline);

    let logo = &email.attachments[1];
    assert_eq!(logo.part_number, "3");
    assert_eq!(logo.filename, "");
    assert_eq!(logo.content_id, "logo@example.com");
    assert_eq!(logo.content_type, "image/png");
    assert!(logo.is_inline);
}

#[test]
fn plain_message_without_envelope_date_uses_internal_date() {
    let email = decode(
        b"* 3 FETCH (UID 77 FLAGS (\\Flagged) RFC822.SIZE 512 \
INTERNALDATE \" 7-Feb-2025 10:00:00 +0000\" \
ENVELOPE (NIL \"Hi\" ((NIL NIL \"x\" \"y.com\")) NIL NIL NIL NIL NIL NIL NIL) \
BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"us-ascii\") NIL NIL \"7BIT\" 5 1 NIL NIL NIL NIL))\r\n",
    );

    assert_eq!(email.uid, 77);
    assert_eq!(email.message_id, "");
    assert_eq!(email.subject, "Hi");
    assert_eq!(email.from_name, "");
    assert_eq!(email.from_email, "x@y.com");
    assert_eq!(email.date, Some(1_738_922_400));
    assert!(email.flags.starred);
    assert!(!email.flags.read);
    assert!(!email.has_attachments);
    assert!(email.attachments.is_empty());
}

#[test]
fn top_level_single_part_attachment_is_part_one() {
    let email = decode(
        b"* 4 FETCH (UID 90 FLAGS () \
BODYSTRUCTURE (\"APPLICATION\" \"OCTET-STREAM\" (\"NAME\" \"dump.bin\") NIL NIL \"BASE64\" 300 NIL NIL NIL NIL))\r\n",
    );

    assert!(email.has_attachments);
    assert_eq!(email.attachments.len(), 1);
    assert_eq!(email.attachments[0].part_number, "1");
    assert_eq!(email.attachments[0].filename, "dump.bin");
    assert_eq!(email.attachments[0].content_type, "application/octet-stream");
}
